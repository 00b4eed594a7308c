//! Repository implementations for PostgreSQL.

mod agent;
mod build_number;
mod job;
mod step;

pub use agent::PgAgentRepository;
pub use build_number::PgBuildNumberRepository;
pub use job::{PgJobRepository, PgJobYmlRepository};
pub use step::PgStepRepository;

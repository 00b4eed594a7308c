//! flow.ci Core
//!
//! Core domain types, traits, and error handling for flow.ci.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler and its adapters.

pub mod agent;
pub mod cmd;
pub mod error;
pub mod events;
pub mod flow;
pub mod ids;
pub mod job;
pub mod ports;
pub mod step;
pub mod tree;
pub mod vars;

pub use error::{Error, Result};
pub use ids::*;
pub use vars::Vars;

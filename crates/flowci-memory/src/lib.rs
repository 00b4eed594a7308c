//! In-process adapters for flow.ci ports.
//!
//! Every adapter keeps its state behind the instance, so tests can build a
//! fresh world per case and inspect it afterwards.

mod bus;
mod coordinator;
mod queue;
mod repositories;

pub use bus::MemoryEventBus;
pub use coordinator::MemoryCoordinator;
pub use queue::MemoryQueue;
pub use repositories::{
    MemoryAgentRepository, MemoryBuildNumberRepository, MemoryJobRepository,
    MemoryJobYmlRepository, MemoryStepRepository,
};

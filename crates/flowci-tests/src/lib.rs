//! Integration test infrastructure for flow.ci.
//!
//! Starts PostgreSQL and NATS (JetStream) in containers and wires the real
//! adapters into a scheduler.
//!
//! # Usage
//!
//! ```ignore
//! use flowci_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     let server = ctx.server(SchedulerConfig::default()).await.unwrap();
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,flowci_scheduler=debug,flowci_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}

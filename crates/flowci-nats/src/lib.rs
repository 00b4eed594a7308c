//! NATS adapters for flow.ci.
//!
//! One [`NatsConnection`] backs three adapters: the [`NatsEventBus`] on a
//! JetStream stream, the [`NatsQueue`] priority work queues, and the
//! [`KvCoordinator`] built on key-value buckets.

mod bus;
pub mod config;
mod connection;
pub mod coord;
pub mod health;
pub mod metrics;
pub mod queue;

pub use bus::{EVENT_SUBJECTS, NatsEventBus};
pub use config::NatsConfig;
pub use connection::NatsConnection;
pub use coord::KvCoordinator;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsSnapshot, NatsMetrics};
pub use queue::NatsQueue;

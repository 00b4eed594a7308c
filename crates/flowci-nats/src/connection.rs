//! Shared NATS client.

use crate::config::NatsConfig;
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;
use async_nats::jetstream;
use flowci_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// One client connection with its JetStream context, shared by every
/// adapter of a process.
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
    reconnected: broadcast::Sender<()>,
}

impl NatsConnection {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!(%urls, "Connecting to NATS");

        let metrics = NatsMetrics::new();
        let (reconnected, _) = broadcast::channel(16);

        let m = metrics.clone();
        let tx = reconnected.clone();
        let initial = Arc::new(AtomicBool::new(true));
        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.request_timeout()))
            .retry_on_initial_connect()
            .event_callback(move |event| {
                let m = m.clone();
                let tx = tx.clone();
                let initial = initial.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            m.set_connected(true);
                            if !initial.swap(false, Ordering::SeqCst) {
                                m.record_reconnect();
                                info!("NATS connection re-established");
                                let _ = tx.send(());
                            }
                        }
                        async_nats::Event::Disconnected => {
                            m.set_connected(false);
                            warn!("NATS connection lost");
                        }
                        other => debug!(event = ?other, "NATS client event"),
                    }
                }
            });

        if let Some(max) = config.max_reconnect_attempts {
            options = options.max_reconnects(max);
        }

        let client = options
            .connect(urls.as_str())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;

        if client.connection_state() == async_nats::connection::State::Connected {
            metrics.set_connected(true);
        }

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config,
            metrics,
            reconnected,
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_snapshot(&self.metrics.snapshot(), self.is_connected())
    }

    /// Fires each time the client recovers from a disconnect.
    pub fn reconnected(&self) -> broadcast::Receiver<()> {
        self.reconnected.subscribe()
    }

    /// Flush pending writes and close the connection.
    pub async fn shutdown(&self) {
        info!("Draining NATS connection");
        if let Err(e) = self.client.drain().await {
            error!(error = %e, "Error draining NATS connection");
        }
        self.metrics.set_connected(false);
    }
}

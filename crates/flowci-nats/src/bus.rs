//! JetStream-backed event bus.

use crate::connection::NatsConnection;
use crate::metrics::NatsMetrics;
use async_nats::jetstream::{
    self, consumer::DeliverPolicy, consumer::pull::Config as ConsumerConfig,
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use bytes::Bytes;
use flowci_core::events::Event;
use flowci_core::ports::{EventBus, EventStream};
use flowci_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subjects carried by the events stream.
pub const EVENT_SUBJECTS: [&str; 3] = ["job.>", "step.>", "agent.>"];

/// Event bus on a JetStream stream.
///
/// Subscriptions only see events published after they were created.
#[derive(Clone)]
pub struct NatsEventBus {
    jetstream: jetstream::Context,
    stream_name: String,
    metrics: Arc<NatsMetrics>,
}

impl NatsEventBus {
    /// Ensure the events stream exists.
    pub async fn new(conn: &NatsConnection) -> Result<Self> {
        let config = conn.config();
        let stream_config = StreamConfig {
            name: config.events_stream.clone(),
            subjects: EVENT_SUBJECTS.iter().map(|s| s.to_string()).collect(),
            retention: jetstream::stream::RetentionPolicy::Limits,
            max_age: config.events_max_age(),
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        };

        conn.jetstream()
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create stream: {}", e)))?;

        info!(stream = %config.events_stream, "Event stream ready");

        Ok(Self {
            jetstream: conn.jetstream().clone(),
            stream_name: config.events_stream.clone(),
            metrics: conn.metrics().clone(),
        })
    }

    /// Number of events currently retained.
    pub async fn retained(&self) -> Result<u64> {
        let mut stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream: {}", e)))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream info: {}", e)))?;
        Ok(info.state.messages)
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        let payload = Bytes::from(serde_json::to_vec(&event)?);
        let len = payload.len() as u64;
        debug!(%subject, "Publishing event");

        let ack = match self.jetstream.publish(subject.clone(), payload).await {
            Ok(ack) => ack,
            Err(e) => {
                self.metrics.record_publish_failure();
                return Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )));
            }
        };

        if let Err(e) = ack.await {
            self.metrics.record_publish_failure();
            return Err(Error::EventBus(format!("Failed to confirm publish: {}", e)));
        }

        self.metrics.record_publish(len);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!(%pattern, "Subscribing to events");

        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                ConsumerConfig {
                    filter_subject: pattern.to_string(),
                    deliver_policy: DeliverPolicy::New,
                    ..Default::default()
                },
                &self.stream_name,
            )
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create consumer: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get messages: {}", e)))?;

        let metrics = self.metrics.clone();
        let stream = messages.then(move |message| {
            let metrics = metrics.clone();
            async move {
                let message =
                    message.map_err(|e| Error::EventBus(format!("Message error: {}", e)))?;
                metrics.record_event(message.payload.len() as u64);

                if let Err(e) = message.ack().await {
                    warn!(error = %e, "Failed to acknowledge event");
                }
                Ok(serde_json::from_slice::<Event>(&message.payload)?)
            }
        });

        Ok(Box::pin(stream))
    }
}

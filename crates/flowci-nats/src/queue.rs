//! Priority work queues on a JetStream work-queue stream.
//!
//! Each named queue has two lanes, `flowci.queue.<queue>.high` and
//! `flowci.queue.<queue>.normal`, each read by a durable consumer. The
//! consumer drains the high lane before it waits on the normal one.

use crate::connection::NatsConnection;
use crate::metrics::NatsMetrics;
use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, Consumer, pull::Config as ConsumerConfig},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use bytes::Bytes;
use flowci_core::ports::{Acknowledge, Delivery, DeliveryStream, MessageQueue, Priority};
use flowci_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SUBJECT_PREFIX: &str = "flowci.queue";

/// Messages taken from the high lane per fetch.
const HIGH_BATCH: usize = 16;

/// How long one wait on the normal lane lasts before the high lane is
/// checked again.
const NORMAL_POLL: Duration = Duration::from_secs(1);

pub fn lane_subject(queue: &str, priority: Priority) -> String {
    let lane = match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
    };
    format!("{}.{}.{}", SUBJECT_PREFIX, queue, lane)
}

/// Durable consumer names cannot contain dots.
pub fn consumer_name(queue: &str, priority: Priority) -> String {
    let lane = match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
    };
    format!("{}-{}", queue.replace(['.', '*', '>', ' '], "_"), lane)
}

#[derive(Clone)]
pub struct NatsQueue {
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    max_deliver: i64,
    ack_wait: Duration,
    metrics: Arc<NatsMetrics>,
}

impl NatsQueue {
    /// Ensure the queue stream exists.
    pub async fn new(conn: &NatsConnection) -> Result<Self> {
        let config = conn.config();
        let stream = conn
            .jetstream()
            .get_or_create_stream(StreamConfig {
                name: config.queue_stream.clone(),
                subjects: vec![format!("{}.>", SUBJECT_PREFIX)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Queue(format!("Failed to create stream: {}", e)))?;

        info!(stream = %config.queue_stream, "Queue stream ready");

        Ok(Self {
            jetstream: conn.jetstream().clone(),
            stream,
            max_deliver: config.max_deliver,
            ack_wait: config.ack_wait(),
            metrics: conn.metrics().clone(),
        })
    }

    async fn lane(&self, queue: &str, priority: Priority) -> Result<Consumer<ConsumerConfig>> {
        let name = consumer_name(queue, priority);
        self.stream
            .get_or_create_consumer(
                &name,
                ConsumerConfig {
                    durable_name: Some(name.clone()),
                    filter_subject: lane_subject(queue, priority),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    max_deliver: self.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to create consumer {}: {}", name, e)))
    }
}

struct JetStreamAck {
    message: jetstream::Message,
    metrics: Arc<NatsMetrics>,
}

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.message
            .ack_with(AckKind::Ack)
            .await
            .map_err(|e| Error::Queue(format!("Failed to ack: {}", e)))?;
        self.metrics.record_ack();
        Ok(())
    }
}

fn delivery(message: jetstream::Message, metrics: &Arc<NatsMetrics>) -> Delivery {
    metrics.record_delivery(message.payload.len() as u64);
    let payload = message.payload.to_vec();
    Delivery::new(
        payload,
        Box::new(JetStreamAck {
            message,
            metrics: metrics.clone(),
        }),
    )
}

#[async_trait]
impl MessageQueue for NatsQueue {
    async fn send(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<()> {
        let subject = lane_subject(queue, priority);
        let len = payload.len() as u64;

        let confirmed = match self.jetstream.publish(subject.clone(), Bytes::from(payload)).await {
            Ok(ack) => ack.await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match confirmed {
            Ok(()) => {
                self.metrics.record_send(len);
                debug!(%subject, "Message queued");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                Err(Error::Queue(format!("Failed to send to {}: {}", subject, e)))
            }
        }
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let high = self.lane(queue, Priority::High).await?;
        let normal = self.lane(queue, Priority::Normal).await?;
        let metrics = self.metrics.clone();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                let mut drained = 0;
                match high.fetch().max_messages(HIGH_BATCH).messages().await {
                    Ok(mut batch) => {
                        while let Some(message) = batch.next().await {
                            match message {
                                Ok(message) => {
                                    drained += 1;
                                    yield Ok(delivery(message, &metrics));
                                }
                                Err(e) => yield Err(Error::Queue(e.to_string())),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%queue, error = %e, "High lane fetch failed");
                        yield Err(Error::Queue(e.to_string()));
                        tokio::time::sleep(NORMAL_POLL).await;
                        continue;
                    }
                }
                if drained > 0 {
                    continue;
                }

                match normal
                    .batch()
                    .max_messages(1)
                    .expires(NORMAL_POLL)
                    .messages()
                    .await
                {
                    Ok(mut batch) => {
                        while let Some(message) = batch.next().await {
                            match message {
                                Ok(message) => yield Ok(delivery(message, &metrics)),
                                Err(e) => yield Err(Error::Queue(e.to_string())),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%queue, error = %e, "Normal lane fetch failed");
                        yield Err(Error::Queue(e.to_string()));
                        tokio::time::sleep(NORMAL_POLL).await;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_naming() {
        assert_eq!(
            lane_subject("flowci.agent.42", Priority::High),
            "flowci.queue.flowci.agent.42.high"
        );
        assert_eq!(
            lane_subject("flowci.jobs", Priority::Normal),
            "flowci.queue.flowci.jobs.normal"
        );
        assert_eq!(
            consumer_name("flowci.agent.42", Priority::Normal),
            "flowci_agent_42-normal"
        );
    }
}

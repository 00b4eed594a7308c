//! Priority queue with FIFO order inside a priority.

use async_trait::async_trait;
use flowci_core::ports::{Acknowledge, Delivery, DeliveryStream, MessageQueue, Priority};
use flowci_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: Priority,
    seq: u64,
    payload: Vec<u8>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Lane {
    heap: BinaryHeap<Entry>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    lanes: HashMap<String, Lane>,
    history: HashMap<String, Vec<(Priority, Vec<u8>)>>,
    failing: Vec<String>,
    seq: u64,
}

/// In-process message queue.
///
/// Keeps a send history per queue so tests can assert on what was sent even
/// after it has been consumed.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
}

struct NoopAck;

#[async_trait]
impl Acknowledge for NoopAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads ever sent to `queue`, in send order.
    pub fn sent(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(queue)
            .map(|h| h.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Payloads ever sent to `queue` together with their priority.
    pub fn sent_with_priority(&self, queue: &str) -> Vec<(Priority, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Pop the next message of `queue` without waiting.
    pub fn try_recv(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state
            .lanes
            .get_mut(queue)
            .and_then(|lane| lane.heap.pop())
            .map(|e| e.payload)
    }

    /// Number of messages waiting in `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .lanes
            .get(queue)
            .map(|lane| lane.heap.len())
            .unwrap_or(0)
    }

    /// Make sends to queues starting with `prefix` fail.
    pub fn fail_sends_to(&self, prefix: &str) {
        self.state.lock().unwrap().failing.push(prefix.to_string());
    }

    /// Undo every `fail_sends_to`.
    pub fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut state = self.state.lock().unwrap();
        state.lanes.entry(queue.to_string()).or_default().notify.clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, queue: &str, payload: Vec<u8>, priority: Priority) -> Result<()> {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.failing.iter().any(|p| queue.starts_with(p.as_str())) {
                return Err(Error::Queue(format!("queue {} unavailable", queue)));
            }

            state.seq += 1;
            let seq = state.seq;
            state
                .history
                .entry(queue.to_string())
                .or_default()
                .push((priority, payload.clone()));

            let lane = state.lanes.entry(queue.to_string()).or_default();
            lane.heap.push(Entry {
                priority,
                seq,
                payload,
            });
            lane.notify.clone()
        };

        debug!(queue, ?priority, "Message enqueued");
        notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let this = self.clone();
        let queue = queue.to_string();
        let notify = self.notifier(&queue);

        let stream = async_stream::stream! {
            loop {
                let notified = notify.notified();
                if let Some(payload) = this.try_recv(&queue) {
                    yield Ok(Delivery::new(payload, Box::new(NoopAck)));
                    continue;
                }
                notified.await;
            }
        };

        Ok(Box::pin(stream))
    }
}

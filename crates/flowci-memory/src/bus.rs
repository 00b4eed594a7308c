//! Broadcast-channel event bus.

use async_trait::async_trait;
use flowci_core::events::Event;
use flowci_core::ports::{EventBus, EventStream};
use flowci_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// Event bus that fans out to in-process subscribers and records every
/// published event.
#[derive(Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<Event>,
    published: Arc<Mutex<Vec<Event>>>,
    failing: Arc<AtomicBool>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            published: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Events published so far, oldest first.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    /// Published events whose subject matches `pattern`.
    pub fn published_on(&self, pattern: &str) -> Vec<Event> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|e| subject_matches(pattern, &e.subject()))
            .cloned()
            .collect()
    }

    /// Make every subsequent publish fail.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::EventBus("publish disabled".to_string()));
        }

        debug!(subject = %event.subject(), "Publishing event");
        self.published.lock().unwrap().push(event.clone());
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if subject_matches(&pattern, &event.subject()) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Subject matching with NATS wildcards: `*` matches one token, `>` the rest.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    subject_tokens.next().is_none()
}

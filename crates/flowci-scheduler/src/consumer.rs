//! Background loops feeding the scheduler.
//!
//! Each queue has exactly one consumer so that dispatch decisions and
//! callback handling are serialized. Messages are acknowledged after they
//! were handled, whatever the outcome; failures end in a job state
//! transition or a log line, never in a redelivery loop.

use crate::scheduler::JobScheduler;
use flowci_core::Result;
use flowci_core::events::Event;
use flowci_core::ids::JobId;
use flowci_core::ports::{DeliveryStream, EventBus, MessageQueue};
use flowci_core::step::ExecutedCmd;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handles of the running background tasks.
pub struct Workers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Start every background task of `scheduler`.
    ///
    /// Subscriptions are established before this returns, so nothing sent
    /// afterwards is missed.
    pub async fn start(
        scheduler: Arc<JobScheduler>,
        queue: Arc<dyn MessageQueue>,
        events: Arc<dyn EventBus>,
    ) -> Result<Self> {
        let mut handles = Vec::new();

        handles.push(("agent-watch", scheduler.agents().watch().await?));

        if let Some(handle) = scheduler.retry().spawn(scheduler.clone()).await {
            handles.push(("retry", handle));
        }

        let jobs = queue.consume(&scheduler.config().job_queue).await?;
        let s = scheduler.clone();
        handles.push((
            "job-consumer",
            tokio::spawn(consume(jobs, move |payload| {
                let s = s.clone();
                async move { handle_job_message(&s, &payload).await }
            })),
        ));

        let callbacks = queue.consume(&scheduler.config().callback_queue).await?;
        let s = scheduler.clone();
        handles.push((
            "callback-consumer",
            tokio::spawn(consume(callbacks, move |payload| {
                let s = s.clone();
                async move { handle_callback_message(&s, &payload).await }
            })),
        ));

        let mut agent_events = events.subscribe("agent.status.*").await?;
        let s = scheduler;
        handles.push((
            "agent-listener",
            tokio::spawn(async move {
                while let Some(event) = agent_events.next().await {
                    match event {
                        Ok(Event::AgentStatusChanged(payload)) => {
                            if let Err(e) = s.on_agent_status_changed(&payload).await {
                                error!(agent = %payload.name, error = %e, "Offline reconciliation failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Agent event stream error"),
                    }
                }
            }),
        ));

        info!(count = handles.len(), "Scheduler workers started");
        Ok(Self { handles })
    }

    /// Names of tasks that have stopped.
    pub fn finished(&self) -> Vec<&'static str> {
        self.handles
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn shutdown(self) {
        for (name, handle) in self.handles {
            handle.abort();
            info!(worker = name, "Worker stopped");
        }
    }
}

async fn consume<F, Fut>(mut stream: DeliveryStream, handler: F)
where
    F: Fn(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => {
                handler(delivery.payload.clone()).await;
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "Failed to acknowledge message");
                }
            }
            Err(e) => warn!(error = %e, "Queue delivery error"),
        }
    }
    warn!("Queue stream ended");
}

/// Decode a job queue payload and hand it to the scheduler.
pub async fn handle_job_message(scheduler: &JobScheduler, payload: &[u8]) {
    let job_id = match std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse::<JobId>().ok())
    {
        Some(id) => id,
        None => {
            warn!(len = payload.len(), "Dropping malformed job message");
            return;
        }
    };

    if let Err(e) = scheduler.handle_job(job_id).await {
        error!(%job_id, error = %e, "Job handling failed");
    }
}

/// Decode a callback payload and hand it to the scheduler.
pub async fn handle_callback_message(scheduler: &JobScheduler, payload: &[u8]) {
    let cmd: ExecutedCmd = match serde_json::from_slice(payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(error = %e, "Dropping malformed callback");
            return;
        }
    };

    let id = cmd.id.clone();
    if let Err(e) = scheduler.process_callback(cmd).await {
        error!(callback = %id, error = %e, "Callback handling failed");
    }
}

//! Delayed re-submission of jobs that found no free agent.

use async_trait::async_trait;
use flowci_core::Result;
use flowci_core::ids::JobId;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receives jobs whose retry delay elapsed.
#[async_trait]
pub trait Resubmit: Send + Sync {
    async fn resubmit(&self, job_id: JobId) -> Result<()>;
}

struct Request {
    job_id: JobId,
    due: Instant,
}

/// Fixed-delay retry on a single worker.
///
/// Requests are served in submission order; with a fixed delay that is also
/// due-time order.
pub struct RetryCoordinator {
    delay: Duration,
    sender: mpsc::UnboundedSender<Request>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    scheduled: AtomicUsize,
}

impl RetryCoordinator {
    pub fn new(delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            delay,
            sender,
            receiver: Mutex::new(Some(receiver)),
            scheduled: AtomicUsize::new(0),
        }
    }

    /// Schedule `job_id` for re-submission after the delay.
    pub fn retry(&self, job_id: JobId) {
        let request = Request {
            job_id,
            due: Instant::now() + self.delay,
        };
        if self.sender.send(request).is_err() {
            warn!(%job_id, "Retry worker gone, job not rescheduled");
            return;
        }
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        debug!(%job_id, delay = ?self.delay, "Job retry scheduled");
    }

    /// Number of retries scheduled so far.
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Start the worker. Only the first call starts one.
    pub async fn spawn(&self, handler: Arc<dyn Resubmit>) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().await.take()?;

        Some(tokio::spawn(async move {
            info!("Retry worker started");
            while let Some(request) = receiver.recv().await {
                tokio::time::sleep_until(request.due).await;
                if let Err(e) = handler.resubmit(request.job_id).await {
                    warn!(job_id = %request.job_id, error = %e, "Job resubmission failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(JobId, Instant)>>,
    }

    #[async_trait]
    impl Resubmit for Recorder {
        async fn resubmit(&self, job_id: JobId) -> Result<()> {
            self.seen.lock().unwrap().push((job_id, Instant::now()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmits_after_delay_in_order() {
        let retry = RetryCoordinator::new(Duration::from_secs(30));
        let recorder = Arc::new(Recorder::default());
        let handle = retry.spawn(recorder.clone()).await.unwrap();
        assert!(retry.spawn(recorder.clone()).await.is_none());

        let start = Instant::now();
        let first = JobId::new();
        let second = JobId::new();
        retry.retry(first);
        retry.retry(second);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(recorder.seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, first);
        assert_eq!(seen[1].0, second);
        assert!(seen[0].1 - start >= Duration::from_secs(30));
        assert_eq!(retry.scheduled(), 2);

        handle.abort();
    }
}

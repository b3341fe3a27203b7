//! Cancellation fan-out.
//!
//! Delivery is best-effort: subscribers may miss ids across lag or
//! reconnects, so workers always re-read job status before committing.

use crate::error::JobResult;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use horizon_core::JobId;
use tokio::sync::broadcast;
use tracing::warn;

#[async_trait]
pub trait CancellationNotifier: Send + Sync {
    /// Announces that `job_id` was cancelled.
    async fn publish(&self, job_id: JobId) -> JobResult<()>;

    /// Opens a new live stream of cancelled job ids. Ids published before
    /// the call are not replayed.
    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobId>>;
}

/// In-process notifier built on a broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobId>,
}

impl BroadcastNotifier {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl CancellationNotifier for BroadcastNotifier {
    async fn publish(&self, job_id: JobId) -> JobResult<()> {
        // No subscribers is fine; the cancelled status is authoritative.
        let _ = self.sender.send(job_id);
        Ok(())
    }

    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobId>> {
        Ok(receiver_stream(self.sender.subscribe()))
    }
}

/// Adapts a broadcast receiver into a stream, skipping over lag gaps.
fn receiver_stream(receiver: broadcast::Receiver<JobId>) -> BoxStream<'static, JobId> {
    Box::pin(stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(job_id) => return Some((job_id, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cancellation subscriber lagged; some notifications were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

//! Cancellation fan-out over PostgreSQL `LISTEN`/`NOTIFY`.

use super::DatabasePool;
use crate::error::JobResult;
use crate::notifier::CancellationNotifier;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use horizon_core::JobId;
use sqlx::postgres::PgListener;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PgCancellationNotifier {
    pool: Arc<DatabasePool>,
    channel: String,
}

impl PgCancellationNotifier {
    pub fn new(pool: Arc<DatabasePool>, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl CancellationNotifier for PgCancellationNotifier {
    async fn publish(&self, job_id: JobId) -> JobResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(job_id.to_string())
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> JobResult<BoxStream<'static, JobId>> {
        let mut listener = PgListener::connect_with(self.pool.inner()).await?;
        listener.listen(&self.channel).await?;
        debug!(channel = %self.channel, "Listening for cancellations");

        // The stream ends on a listener error; subscribers open a new one.
        Ok(Box::pin(stream::unfold(listener, |mut listener| async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match notification.payload().parse::<JobId>() {
                        Ok(job_id) => return Some((job_id, listener)),
                        Err(e) => {
                            warn!(payload = notification.payload(), error = %e, "Ignoring malformed cancellation");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Cancellation listener failed");
                        return None;
                    }
                }
            }
        })))
    }
}

//! Exclusive Run Lock: a named, time-bounded leader lease.
//!
//! Contention is not an error: `try_acquire_exclusive_run` returns `None`
//! and the caller skips its run.

use crate::coordinator::{with_deadline, DEFAULT_OPERATION_TIMEOUT};
use crate::error::JobResult;
use crate::store::{ExclusiveRunLease, ExclusiveRunStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ExclusiveRunLock {
    store: Arc<dyn ExclusiveRunStore>,
    operation_timeout: Duration,
}

impl ExclusiveRunLock {
    pub fn new(store: Arc<dyn ExclusiveRunStore>) -> Self {
        Self {
            store,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Sets the per-call deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Takes the `run_type` lease for `lease_duration` unless someone else
    /// holds an unexpired one.
    pub async fn try_acquire_exclusive_run(
        &self,
        run_type: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> JobResult<Option<ExclusiveRunGuard>> {
        let acquired = with_deadline(
            self.operation_timeout,
            "try_acquire_exclusive_run",
            self.store.try_acquire(run_type, holder_id, lease_duration),
        )
        .await?;

        match acquired {
            Some(lease) => {
                info!(run_type, holder_id, expires_at = %lease.expires_at, "Exclusive run acquired");
                Ok(Some(ExclusiveRunGuard {
                    store: self.store.clone(),
                    lease,
                    operation_timeout: self.operation_timeout,
                    released: AtomicBool::new(false),
                }))
            }
            None => {
                debug!(run_type, holder_id, "Exclusive run held elsewhere");
                Ok(None)
            }
        }
    }
}

/// Proof of holding an exclusive run lease.
///
/// `release` is idempotent. Dropping an unreleased guard schedules a
/// best-effort release on the current runtime; if that never runs the
/// lease simply expires.
pub struct ExclusiveRunGuard {
    store: Arc<dyn ExclusiveRunStore>,
    lease: ExclusiveRunLease,
    operation_timeout: Duration,
    released: AtomicBool,
}

impl ExclusiveRunGuard {
    pub fn lease(&self) -> &ExclusiveRunLease {
        &self.lease
    }

    /// Clears the lease early. Only the lease this guard acquired is
    /// cleared, never a successor's.
    pub async fn release(&self) -> JobResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cleared = with_deadline(
            self.operation_timeout,
            "release_exclusive_run",
            self.store.release(&self.lease.run_type, self.lease.token),
        )
        .await?;

        if cleared {
            info!(run_type = %self.lease.run_type, holder_id = %self.lease.holder_id, "Exclusive run released");
        } else {
            debug!(run_type = %self.lease.run_type, "Exclusive run already expired or taken over");
        }
        Ok(())
    }
}

impl Drop for ExclusiveRunGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let run_type = self.lease.run_type.clone();
        let token = self.lease.token;
        handle.spawn(async move {
            if let Err(e) = store.release(&run_type, token).await {
                warn!(run_type = %run_type, error = %e, "Failed to release dropped exclusive run");
            }
        });
    }
}

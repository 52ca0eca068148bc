//! Distributed per-region lock.
//!
//! One lock document per region guards the tick. Acquisition is a
//! compare-and-set against the store (absent, expired, or already ours);
//! a heartbeat extends the expiry while the tick runs. When an extension
//! reports the lock stolen or missing, the tick must stop scheduling new
//! work; in-flight probes finish and their writes still land
//! (at-least-once is acceptable).

use crate::config::Region;
use crate::core::ports::{LockAcquire, LockExtend, TargetStore};
use crate::core::shutdown::ShutdownSignal;
use crate::core::types::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct RegionLock {
    store: Arc<dyn TargetStore>,
    doc: String,
    owner: String,
    ttl_ms: i64,
    lost: AtomicBool,
}

impl RegionLock {
    /// Lock document key for a region.
    pub fn doc_for(region: Region) -> String {
        format!("scheduler-lock:{region}")
    }

    /// Try to take the region lock. `None` means another tick holds it.
    pub async fn acquire(
        store: Arc<dyn TargetStore>,
        region: Region,
        ttl_ms: i64,
    ) -> Result<Option<Arc<RegionLock>>, StoreError> {
        let owner = Uuid::new_v4().to_string();
        let doc = Self::doc_for(region);
        match store.acquire_lock(&doc, &owner, ttl_ms).await? {
            LockAcquire::Acquired => {
                debug!(%doc, %owner, "region lock acquired");
                Ok(Some(Arc::new(RegionLock {
                    store,
                    doc,
                    owner,
                    ttl_ms,
                    lost: AtomicBool::new(false),
                })))
            }
            LockAcquire::Taken => Ok(None),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// True once a heartbeat found the lock stolen or missing.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Heartbeat loop: extend the expiry every `interval` until shutdown,
    /// release, or loss of ownership.
    pub async fn heartbeat(self: Arc<Self>, interval: Duration, shutdown: Arc<ShutdownSignal>) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.is_lost() {
                break;
            }
            match self
                .store
                .extend_lock(&self.doc, &self.owner, self.ttl_ms)
                .await
            {
                Ok(LockExtend::Extended) => {
                    debug!(doc = %self.doc, "region lock extended");
                }
                Ok(LockExtend::Stolen) | Ok(LockExtend::Missing) => {
                    warn!(doc = %self.doc, "region lock no longer ours, stopping new work");
                    self.lost.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    // Transient store trouble: keep trying, the TTL gives
                    // slack for several missed beats.
                    warn!(doc = %self.doc, error = %e, "lock heartbeat failed");
                }
            }
        }
    }

    /// Conditional release; a stolen lock is left alone.
    pub async fn release(&self) {
        if self.is_lost() {
            return;
        }
        if let Err(e) = self.store.release_lock(&self.doc, &self.owner).await {
            warn!(doc = %self.doc, error = %e, "region lock release failed");
        }
    }
}

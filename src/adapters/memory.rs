//! In-memory target store and warehouse.
//!
//! The store implements the full port contract, including the
//! compare-and-set lock document, so scheduler behavior (paging, lock
//! contention, mutation application) can be exercised without external
//! systems. The warehouse records submitted batches and can be scripted to
//! return partial failures or whole-batch errors.

use crate::config::Region;
use crate::core::ports::{DuePage, InsertOutcome, LockAcquire, LockExtend, TargetStore, Warehouse};
use crate::core::types::{MutationUpdate, StoreError, Target, TelemetryRow, WarehouseError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tokio::sync::Mutex;

struct LockDoc {
    owner: String,
    expires_at_ms: i64,
}

#[derive(Default)]
struct StoreState {
    targets: BTreeMap<String, Target>,
    locks: HashMap<String, LockDoc>,
}

/// In-memory target store with lock-document semantics.
///
/// Time for lock expiry comes from an internal epoch-ms cell so tests can
/// move the clock; production local runs never touch it and use wall time.
pub struct MemoryTargetStore {
    state: Mutex<StoreState>,
    /// Epoch-ms override for lock expiry checks; 0 means wall clock.
    now_override_ms: AtomicI64,
    /// Number of upcoming `apply_updates` calls that should fail.
    fail_applies: AtomicU32,
    applied: AtomicU32,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            now_override_ms: AtomicI64::new(0),
            fail_applies: AtomicU32::new(0),
            applied: AtomicU32::new(0),
        }
    }

    pub async fn insert_target(&self, target: Target) {
        let mut state = self.state.lock().await;
        state.targets.insert(target.id.clone(), target);
    }

    pub async fn get_target(&self, id: &str) -> Option<Target> {
        self.state.lock().await.targets.get(id).cloned()
    }

    pub async fn target_count(&self) -> usize {
        self.state.lock().await.targets.len()
    }

    /// Make the next `n` `apply_updates` calls fail with a store error.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    /// Number of successful `apply_updates` calls so far.
    pub fn applied_batches(&self) -> u32 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Pin "now" for lock-expiry checks (tests only).
    pub fn set_now_ms(&self, now_ms: i64) {
        self.now_override_ms.store(now_ms, Ordering::SeqCst);
    }

    fn now_ms(&self) -> i64 {
        let pinned = self.now_override_ms.load(Ordering::SeqCst);
        if pinned != 0 {
            pinned
        } else {
            chrono::Utc::now().timestamp_millis()
        }
    }
}

impl Default for MemoryTargetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn page_due(
        &self,
        now_ms: i64,
        region: Region,
        include_unassigned: bool,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<DuePage, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<&Target> = state
            .targets
            .values()
            .filter(|t| !t.disabled && t.next_check_at <= now_ms)
            .filter(|t| match t.region {
                Some(r) => r == region,
                None => include_unassigned,
            })
            .collect();
        due.sort_by_key(|t| (t.next_check_at, t.id.clone()));

        let offset = cursor
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let page: Vec<Target> = due
            .iter()
            .skip(offset)
            .take(limit)
            .map(|t| (*t).clone())
            .collect();
        let truncated = offset + page.len() < due.len();

        Ok(DuePage {
            next_cursor: truncated.then(|| (offset + page.len()).to_string()),
            targets: page,
            truncated,
        })
    }

    async fn apply_updates(&self, updates: Vec<MutationUpdate>) -> Result<(), StoreError> {
        if self
            .fail_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Io("scripted apply failure".into()));
        }

        let mut state = self.state.lock().await;
        for update in updates {
            // Targets deleted out from under a pending mutation are skipped.
            let Some(existing) = state.targets.get(&update.target_id) else {
                continue;
            };
            let mut doc = serde_json::to_value(existing)
                .map_err(|e| StoreError::Rejected(e.to_string()))?;
            if let Some(obj) = doc.as_object_mut() {
                for (field, value) in update.fields {
                    obj.insert(field, value);
                }
            }
            let merged: Target =
                serde_json::from_value(doc).map_err(|e| StoreError::Rejected(e.to_string()))?;
            state.targets.insert(update.target_id, merged);
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        doc: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<LockAcquire, StoreError> {
        let now = self.now_ms();
        let mut state = self.state.lock().await;
        match state.locks.get(doc) {
            Some(existing) if existing.expires_at_ms > now && existing.owner != owner => {
                Ok(LockAcquire::Taken)
            }
            _ => {
                state.locks.insert(
                    doc.to_string(),
                    LockDoc {
                        owner: owner.to_string(),
                        expires_at_ms: now + ttl_ms,
                    },
                );
                Ok(LockAcquire::Acquired)
            }
        }
    }

    async fn extend_lock(
        &self,
        doc: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<LockExtend, StoreError> {
        let now = self.now_ms();
        let mut state = self.state.lock().await;
        match state.locks.get_mut(doc) {
            None => Ok(LockExtend::Missing),
            Some(existing) if existing.owner != owner => Ok(LockExtend::Stolen),
            Some(existing) => {
                existing.expires_at_ms = now + ttl_ms;
                Ok(LockExtend::Extended)
            }
        }
    }

    async fn release_lock(&self, doc: &str, owner: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.get(doc).is_some_and(|l| l.owner == owner) {
            state.locks.remove(doc);
        }
        Ok(())
    }
}

#[derive(Default)]
struct WarehouseState {
    rows: Vec<TelemetryRow>,
    batches: usize,
    script: VecDeque<Result<InsertOutcome, WarehouseError>>,
}

/// In-memory warehouse with scriptable insert outcomes.
pub struct MemoryWarehouse {
    state: Mutex<WarehouseState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WarehouseState::default()),
        }
    }

    /// Queue the outcome for an upcoming insert; once the script runs dry
    /// every insert succeeds.
    pub async fn script_outcome(&self, outcome: Result<InsertOutcome, WarehouseError>) {
        self.state.lock().await.script.push_back(outcome);
    }

    /// Rows accepted so far (whole-batch and partial successes).
    pub async fn inserted_rows(&self) -> Vec<TelemetryRow> {
        self.state.lock().await.rows.clone()
    }

    pub async fn batch_count(&self) -> usize {
        self.state.lock().await.batches
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn insert(
        &self,
        _table: &str,
        rows: &[TelemetryRow],
    ) -> Result<InsertOutcome, WarehouseError> {
        let mut state = self.state.lock().await;
        state.batches += 1;
        let outcome = state.script.pop_front().unwrap_or(Ok(InsertOutcome::Ok));
        match &outcome {
            Ok(InsertOutcome::Ok) => state.rows.extend(rows.iter().cloned()),
            Ok(InsertOutcome::PartialFailure { indices }) => {
                for (i, row) in rows.iter().enumerate() {
                    if !indices.contains(&i) {
                        state.rows.push(row.clone());
                    }
                }
            }
            Err(_) => {}
        }
        outcome
    }

    async fn query(
        &self,
        _sql: &str,
        _params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, WarehouseError> {
        Ok(Vec::new())
    }
}

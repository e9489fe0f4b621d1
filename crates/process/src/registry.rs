//! PID registry with a slot semaphore.
//!
//! Agent runners must hold a [`SlotPermit`] before spawning provider work;
//! releasing a permit (on drop) wakes exactly one waiter. The registry
//! itself only tracks metadata - children are owned by their spawning task,
//! which must `unregister` when the child exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use cm_domain::error::{Error, Result};

/// A held concurrency slot. Dropping it frees the slot and wakes one waiter.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

/// Metadata for one registered child process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegisteredProcess {
    pub pid: u32,
    pub session_db_id: i64,
    pub registered_at: DateTime<Utc>,
}

pub struct ProcessRegistry {
    max_concurrent: usize,
    slots: Arc<Semaphore>,
    processes: Mutex<HashMap<u32, RegisteredProcess>>,
}

impl ProcessRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait for a free slot, up to `timeout`.
    pub async fn acquire_slot(&self, timeout: Duration) -> Result<SlotPermit> {
        let acquired = tokio::time::timeout(timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "no agent slot freed within {}ms",
                    timeout.as_millis()
                ))
            })?;
        let permit = acquired.map_err(|_| Error::Other("slot semaphore closed".into()))?;
        Ok(SlotPermit { _permit: permit })
    }

    /// Record a spawned child. Overwrites any stale entry for the same PID.
    pub fn register(&self, pid: u32, session_db_id: i64) {
        self.processes.lock().insert(
            pid,
            RegisteredProcess {
                pid,
                session_db_id,
                registered_at: Utc::now(),
            },
        );
        tracing::debug!(pid, session_db_id, "child process registered");
    }

    /// Remove a child on exit. Returns whether the PID was known.
    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.processes.lock().remove(&pid).is_some();
        if removed {
            tracing::debug!(pid, "child process unregistered");
        }
        removed
    }

    /// Number of currently registered children.
    pub fn count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Snapshot of all registered children.
    pub fn list(&self) -> Vec<RegisteredProcess> {
        self.processes.lock().values().cloned().collect()
    }

    /// Registered PIDs belonging to one session.
    pub fn pids_for_session(&self, session_db_id: i64) -> Vec<u32> {
        self.processes
            .lock()
            .values()
            .filter(|p| p.session_db_id == session_db_id)
            .map(|p| p.pid)
            .collect()
    }

    /// Registered PIDs whose session is no longer in `active_session_ids`.
    pub fn orphaned_pids(&self, active_session_ids: &[i64]) -> Vec<u32> {
        self.processes
            .lock()
            .values()
            .filter(|p| !active_session_ids.contains(&p.session_db_id))
            .map(|p| p.pid)
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_unregister_lifecycle() {
        let registry = ProcessRegistry::new(4);
        registry.register(100, 1);
        registry.register(101, 2);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.pids_for_session(1), vec![100]);

        assert!(registry.unregister(100));
        assert!(!registry.unregister(100));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn cap_is_never_exceeded() {
        let registry = Arc::new(ProcessRegistry::new(2));

        let p1 = registry.acquire_slot(Duration::from_secs(1)).await.unwrap();
        let _p2 = registry.acquire_slot(Duration::from_secs(1)).await.unwrap();

        // Third acquisition must wait, not exceed.
        let err = registry
            .acquire_slot(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Releasing one slot wakes exactly one waiter.
        let registry2 = registry.clone();
        let waiter =
            tokio::spawn(async move { registry2.acquire_slot(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(p1);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn orphaned_pids_by_session() {
        let registry = ProcessRegistry::new(2);
        registry.register(10, 1);
        registry.register(11, 2);
        registry.register(12, 3);

        let mut orphans = registry.orphaned_pids(&[1, 3]);
        orphans.sort_unstable();
        assert_eq!(orphans, vec![11]);
    }

    #[tokio::test]
    async fn zero_cap_is_clamped_to_one() {
        let registry = ProcessRegistry::new(0);
        assert_eq!(registry.max_concurrent(), 1);
        let _permit = registry.acquire_slot(Duration::from_secs(1)).await.unwrap();
    }
}

//! Keyed try-mutex contract and the in-memory provider.
//!
//! Volume ids and volume names live in separate key spaces so a name can
//! never collide with an id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use csirpc::Status;

/// Polling interval of the in-memory try-lock.
const SPIN_SLEEP: Duration = Duration::from_millis(3);

/// A keyed try-mutex.
///
/// Two lock objects for the same key contend with each other; they denote the
/// same underlying lock.
#[async_trait]
pub trait TryLock: Send + Sync {
    /// Attempt to acquire the lock, waiting at most `timeout`.
    ///
    /// Returns `false` when the lock is still contended once the budget is
    /// spent. A zero timeout fails immediately on contention.
    ///
    /// # Errors
    /// Provider failures (a distributed backend losing its store) surface
    /// unchanged.
    async fn try_lock(&self, timeout: Duration) -> Result<bool, Status>;

    /// Release the lock.
    ///
    /// # Errors
    /// Provider failures surface unchanged.
    async fn unlock(&self) -> Result<(), Status>;

    /// Release any provider-side state tied to this lock object.
    ///
    /// # Errors
    /// Provider failures surface unchanged.
    async fn close(&self) -> Result<(), Status> {
        Ok(())
    }
}

/// Factory for keyed try-mutexes.
#[async_trait]
pub trait VolumeLockProvider: Send + Sync {
    /// The lock guarding the volume with this id.
    ///
    /// # Errors
    /// Provider failures surface unchanged.
    async fn lock_with_id(&self, id: &str) -> Result<Arc<dyn TryLock>, Status>;

    /// The lock guarding the volume with this name (used before an id
    /// exists).
    ///
    /// # Errors
    /// Provider failures surface unchanged.
    async fn lock_with_name(&self, name: &str) -> Result<Arc<dyn TryLock>, Status>;
}

/// In-memory lock state: a held flag behind a mutex.
#[derive(Debug, Default)]
struct MemoryLock {
    held: Mutex<bool>,
}

#[async_trait]
impl TryLock for MemoryLock {
    /// Spin-with-sleep up to the timeout.
    async fn try_lock(&self, timeout: Duration) -> Result<bool, Status> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
                if !*held {
                    *held = true;
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SPIN_SLEEP.min(deadline - now)).await;
        }
    }

    async fn unlock(&self) -> Result<(), Status> {
        *self.held.lock().unwrap_or_else(|e| e.into_inner()) = false;
        Ok(())
    }
}

/// The default, process-local lock provider.
///
/// Locks are created lazily on first request and never garbage-collected;
/// the maps are bounded by the number of volumes the plug-in touches.
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    /// Locks keyed by volume id
    id_locks: Mutex<HashMap<String, Arc<MemoryLock>>>,
    /// Locks keyed by volume name
    name_locks: Mutex<HashMap<String, Arc<MemoryLock>>>,
}

impl MemoryLockProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(map: &Mutex<HashMap<String, Arc<MemoryLock>>>, key: &str) -> Arc<MemoryLock> {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(key.to_owned())
                .or_insert_with(|| Arc::new(MemoryLock::default())),
        )
    }
}

#[async_trait]
impl VolumeLockProvider for MemoryLockProvider {
    async fn lock_with_id(&self, id: &str) -> Result<Arc<dyn TryLock>, Status> {
        Ok(Self::entry(&self.id_locks, id))
    }

    async fn lock_with_name(&self, name: &str) -> Result<Arc<dyn TryLock>, Status> {
        Ok(Self::entry(&self.name_locks, name))
    }
}

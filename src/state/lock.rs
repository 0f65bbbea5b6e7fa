//! Scoped lock handle (§9 redesign flag: replace manual ref-counted locks
//! with an RAII guard). Holding a `LockGuard` does not renew the lease by
//! itself; call `extend` before the TTL lapses.

use crate::error::Result;
use crate::state::manager::StateManager;
use std::sync::Arc;
use std::time::Duration;

/// Releases the underlying fencing-token lock when dropped. `Drop` cannot
/// await, so release on drop is best-effort and fire-and-forget; callers
/// that need release to be confirmed should call `release` explicitly.
pub struct LockGuard {
    resource_key: String,
    lock_id: u64,
    manager: Arc<StateManager>,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(resource_key: String, lock_id: u64, manager: Arc<StateManager>) -> Self {
        Self {
            resource_key,
            lock_id,
            manager,
            released: false,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// The fencing token presented by this guard; downstream services
    /// should reject writes carrying a smaller token for the same resource.
    pub fn fencing_token(&self) -> u64 {
        self.lock_id
    }

    pub async fn extend(&self, additional_ttl: Duration) -> Result<()> {
        self.manager
            .extend_lock(&self.resource_key, self.lock_id, additional_ttl)
            .await
    }

    /// Releases the lock and awaits confirmation, consuming the guard.
    pub async fn release(mut self) {
        self.manager.release_lock(&self.resource_key, self.lock_id).await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let resource_key = self.resource_key.clone();
        let lock_id = self.lock_id;
        tokio::spawn(async move {
            manager.release_lock(&resource_key, lock_id).await;
        });
    }
}

// Copyright 2024 GarnetFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Namespace locks keyed by `(bucket, object...)`. Acquisition fans out
//! to every peer lock server and succeeds once a write quorum grants;
//! a background refresh keeps the lease alive and cancels the guard's
//! token when the lease is lost mid-operation.

use crate::client::LockClient;
use crate::error::{LockError, Result};
use crate::types::{LOCK_REFRESH_INTERVAL, LockRequest, LockType};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

/// One lockable resource within a bucket namespace.
#[derive(Debug, Clone)]
pub struct NamespaceLock {
    clients: Vec<Arc<dyn LockClient>>,
    owner_prefix: String,
    resource: String,
}

impl NamespaceLock {
    pub fn new(clients: Vec<Arc<dyn LockClient>>, owner_prefix: &str, bucket: &str, object: &str) -> Self {
        Self {
            clients,
            owner_prefix: owner_prefix.to_string(),
            resource: format!("{bucket}/{object}"),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn quorum(&self) -> usize {
        self.clients.len() / 2 + 1
    }

    pub async fn get_write_lock(&self, timeout: Duration) -> Result<NamespaceLockGuard> {
        self.acquire(LockType::Write, timeout).await
    }

    pub async fn get_read_lock(&self, timeout: Duration) -> Result<NamespaceLockGuard> {
        self.acquire(LockType::Read, timeout).await
    }

    async fn acquire(&self, lock_type: LockType, timeout: Duration) -> Result<NamespaceLockGuard> {
        let req = LockRequest {
            resource: self.resource.clone(),
            // Fresh owner per acquisition so release/refresh never race a
            // previous holder from the same node.
            owner: format!("{}:{}", self.owner_prefix, Uuid::new_v4()),
            lock_type,
            timeout,
        };

        let mut granted_on = Vec::with_capacity(self.clients.len());
        let mut granted = 0usize;

        for client in &self.clients {
            match client.acquire(&req).await {
                Ok(true) => {
                    granted += 1;
                    granted_on.push(client.clone());
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("lock peer failed for {}: {}", self.resource, err);
                }
            }
        }

        if granted < self.quorum() {
            // Roll back partial grants so a failed attempt leaves nothing
            // behind.
            for client in &granted_on {
                let _ = client.release(&req).await;
            }
            if granted == 0 {
                return Err(LockError::Timeout(timeout, self.resource.clone()));
            }
            return Err(LockError::QuorumNotMet {
                granted,
                total: self.clients.len(),
                quorum: self.quorum(),
            });
        }

        Ok(NamespaceLockGuard::new(req, granted_on, self.quorum()))
    }
}

/// RAII guard for a held namespace lock. Dropping it releases the lock on
/// every peer that granted it. `cancellation_token` fires if the lease is
/// lost before release; callers must abort and propagate instead of
/// trusting their result.
#[derive(Debug)]
pub struct NamespaceLockGuard {
    req: LockRequest,
    clients: Vec<Arc<dyn LockClient>>,
    cancel: CancellationToken,
    refresh_stop: CancellationToken,
}

impl NamespaceLockGuard {
    fn new(req: LockRequest, clients: Vec<Arc<dyn LockClient>>, quorum: usize) -> Self {
        let cancel = CancellationToken::new();
        let refresh_stop = CancellationToken::new();

        let refresh_req = req.clone();
        let refresh_clients = clients.clone();
        let refresh_cancel = cancel.clone();
        let stop = refresh_stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOCK_REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately, skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut alive = 0usize;
                        for client in &refresh_clients {
                            if let Ok(true) = client.refresh(&refresh_req).await {
                                alive += 1;
                            }
                        }
                        if alive < quorum {
                            error!("lock lease lost for {}", refresh_req.resource);
                            refresh_cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });

        Self {
            req,
            clients,
            cancel,
            refresh_stop,
        }
    }

    /// Fires when the lock was lost while still held.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for NamespaceLockGuard {
    fn drop(&mut self) {
        self.refresh_stop.cancel();
        // The unlock path always runs, even when the lease was already
        // lost, so grantors converge.
        self.cancel.cancel();
        let req = self.req.clone();
        let clients = std::mem::take(&mut self.clients);
        // Dropping outside a runtime (process teardown) leaves the lease
        // to expire on its own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for client in clients {
                    if let Err(err) = client.release(&req).await {
                        warn!("failed to release lock {}: {}", req.resource, err);
                    }
                }
            });
        }
    }
}

/// Per-process factory handing out namespace locks over a fixed peer set.
#[derive(Debug)]
pub struct NsLockMap {
    clients: Vec<Arc<dyn LockClient>>,
    owner_prefix: String,
}

impl NsLockMap {
    pub fn new(clients: Vec<Arc<dyn LockClient>>, owner_prefix: &str) -> Self {
        Self {
            clients,
            owner_prefix: owner_prefix.to_string(),
        }
    }

    pub fn new_ns_lock(&self, bucket: &str, object: &str) -> NamespaceLock {
        NamespaceLock::new(self.clients.clone(), &self.owner_prefix, bucket, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalClient;
    use crate::local::LocalLockMap;

    fn single_peer() -> Vec<Arc<dyn LockClient>> {
        vec![LocalClient::new(LocalLockMap::new()) as Arc<dyn LockClient>]
    }

    #[tokio::test]
    async fn test_write_lock_blocks_second_writer() {
        let clients = single_peer();
        let ns = NamespaceLock::new(clients.clone(), "node1", "bucket", "object");

        let guard = ns.get_write_lock(Duration::from_millis(50)).await.unwrap();
        assert!(!guard.is_lost());

        let second = ns.get_write_lock(Duration::from_millis(50)).await;
        assert!(second.is_err());

        drop(guard);
        // Release happens on a spawned task; poll until it lands.
        for _ in 0..100 {
            if ns.get_write_lock(Duration::from_millis(10)).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lock never released after guard drop");
    }

    #[tokio::test]
    async fn test_read_locks_are_shared() {
        let ns = NamespaceLock::new(single_peer(), "node1", "bucket", "object");
        let _a = ns.get_read_lock(Duration::from_millis(50)).await.unwrap();
        let _b = ns.get_read_lock(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_quorum_across_peers() {
        // Three peers, one of which always refuses: a 2-of-3 quorum still
        // acquires.
        #[derive(Debug)]
        struct RefusingClient;

        #[async_trait::async_trait]
        impl LockClient for RefusingClient {
            async fn acquire(&self, _req: &LockRequest) -> crate::error::Result<bool> {
                Ok(false)
            }
            async fn release(&self, _req: &LockRequest) -> crate::error::Result<()> {
                Ok(())
            }
            async fn refresh(&self, _req: &LockRequest) -> crate::error::Result<bool> {
                Ok(false)
            }
            async fn is_online(&self) -> bool {
                true
            }
            fn is_local(&self) -> bool {
                false
            }
        }

        let clients: Vec<Arc<dyn LockClient>> = vec![
            LocalClient::new(LocalLockMap::new()),
            LocalClient::new(LocalLockMap::new()),
            Arc::new(RefusingClient),
        ];
        let ns = NamespaceLock::new(clients, "node1", "bucket", "object");
        let guard = ns.get_write_lock(Duration::from_millis(50)).await;
        assert!(guard.is_ok());
    }
}

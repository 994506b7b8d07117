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

use crate::error::{LockError, Result};
use crate::types::{LOCK_LEASE_DURATION, LOCK_RETRY_INTERVAL, LockInfo, LockType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Holder bookkeeping for one resource.
#[derive(Debug, Default)]
struct LockEntry {
    /// Owner of the exclusive lock, if any.
    writer: Option<String>,
    /// Reader owners with reentrancy counts.
    readers: HashMap<String, usize>,
    /// Last refresh per owner; stale holders are expired lazily.
    last_refresh: HashMap<String, Instant>,
}

impl LockEntry {
    fn expire_stale(&mut self, lease: Duration) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .last_refresh
            .iter()
            .filter(|(_, t)| now.duration_since(**t) > lease)
            .map(|(owner, _)| owner.clone())
            .collect();

        for owner in stale {
            if self.writer.as_deref() == Some(owner.as_str()) {
                self.writer = None;
            }
            self.readers.remove(&owner);
            self.last_refresh.remove(&owner);
        }
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// In-process lock table. One instance per lock server; the local node
/// shares a single map across all erasure sets.
#[derive(Debug, Default)]
pub struct LocalLockMap {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LocalLockMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tries once; returns false when the resource is contended.
    async fn try_lock(&self, resource: &str, owner: &str, lock_type: LockType) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(resource.to_string()).or_default();
        entry.expire_stale(LOCK_LEASE_DURATION);

        match lock_type {
            LockType::Write => {
                let held_elsewhere = entry.writer.as_deref().is_some_and(|w| w != owner)
                    || entry.readers.keys().any(|r| r != owner);
                if held_elsewhere {
                    return false;
                }
                entry.writer = Some(owner.to_string());
            }
            LockType::Read => {
                if entry.writer.as_deref().is_some_and(|w| w != owner) {
                    return false;
                }
                *entry.readers.entry(owner.to_string()).or_insert(0) += 1;
            }
        }

        entry.last_refresh.insert(owner.to_string(), Instant::now());
        true
    }

    /// Acquires with retries until `timeout` elapses.
    pub async fn lock(&self, resource: &str, owner: &str, lock_type: LockType, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(resource, owner, lock_type).await {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    pub async fn unlock(&self, resource: &str, owner: &str, lock_type: LockType) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(resource) else {
            return Err(LockError::NotHeld(owner.to_string()));
        };

        match lock_type {
            LockType::Write => {
                if entry.writer.as_deref() != Some(owner) {
                    return Err(LockError::NotHeld(owner.to_string()));
                }
                entry.writer = None;
                entry.last_refresh.remove(owner);
            }
            LockType::Read => {
                let Some(count) = entry.readers.get_mut(owner) else {
                    return Err(LockError::NotHeld(owner.to_string()));
                };
                *count -= 1;
                if *count == 0 {
                    entry.readers.remove(owner);
                    entry.last_refresh.remove(owner);
                }
            }
        }

        if entry.is_free() {
            entries.remove(resource);
        }

        Ok(())
    }

    /// Extends the lease; false means the holder already expired and the
    /// caller must abort whatever the lock protected.
    pub async fn refresh(&self, resource: &str, owner: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(resource) else {
            return Ok(false);
        };

        let held = entry.writer.as_deref() == Some(owner) || entry.readers.contains_key(owner);
        if held {
            entry.last_refresh.insert(owner.to_string(), Instant::now());
        }
        Ok(held)
    }

    pub async fn holders(&self, resource: &str) -> Vec<LockInfo> {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(resource) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        if let Some(writer) = &entry.writer {
            out.push(LockInfo {
                resource: resource.to_string(),
                owner: writer.clone(),
                lock_type: LockType::Write,
                since_unix_ms: 0,
            });
        }
        for owner in entry.readers.keys() {
            out.push(LockInfo {
                resource: resource.to_string(),
                owner: owner.clone(),
                lock_type: LockType::Read,
                since_unix_ms: 0,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_excludes_write() {
        let map = LocalLockMap::new();
        assert!(map.lock("b/o", "a", LockType::Write, Duration::from_millis(10)).await.unwrap());
        assert!(!map.lock("b/o", "b", LockType::Write, Duration::from_millis(10)).await.unwrap());
        map.unlock("b/o", "a", LockType::Write).await.unwrap();
        assert!(map.lock("b/o", "b", LockType::Write, Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_readers_share() {
        let map = LocalLockMap::new();
        assert!(map.lock("b/o", "a", LockType::Read, Duration::from_millis(10)).await.unwrap());
        assert!(map.lock("b/o", "b", LockType::Read, Duration::from_millis(10)).await.unwrap());
        assert!(!map.lock("b/o", "c", LockType::Write, Duration::from_millis(10)).await.unwrap());
        map.unlock("b/o", "a", LockType::Read).await.unwrap();
        map.unlock("b/o", "b", LockType::Read).await.unwrap();
        assert!(map.lock("b/o", "c", LockType::Write, Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_requires_holder() {
        let map = LocalLockMap::new();
        assert!(map.unlock("b/o", "nobody", LockType::Write).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_reports_lost_lease() {
        let map = LocalLockMap::new();
        assert!(map.lock("b/o", "a", LockType::Write, Duration::from_millis(10)).await.unwrap());
        assert!(map.refresh("b/o", "a").await.unwrap());
        map.unlock("b/o", "a", LockType::Write).await.unwrap();
        assert!(!map.refresh("b/o", "a").await.unwrap());
    }
}

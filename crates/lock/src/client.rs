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

use crate::error::Result;
use crate::local::LocalLockMap;
use crate::types::LockRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Contract every lock server answers, local or across the wire. A lock
/// is durable once a write quorum of clients granted it.
#[async_trait]
pub trait LockClient: std::fmt::Debug + Send + Sync {
    /// Grants or refuses within the request's timeout.
    async fn acquire(&self, req: &LockRequest) -> Result<bool>;

    /// Releases; idempotent for owners that no longer hold the lock.
    async fn release(&self, req: &LockRequest) -> Result<()>;

    /// Extends the lease; false when the lease already expired.
    async fn refresh(&self, req: &LockRequest) -> Result<bool>;

    async fn is_online(&self) -> bool;

    fn is_local(&self) -> bool;
}

/// LockClient over the in-process lock table.
#[derive(Debug)]
pub struct LocalClient {
    map: Arc<LocalLockMap>,
}

impl LocalClient {
    pub fn new(map: Arc<LocalLockMap>) -> Arc<Self> {
        Arc::new(Self { map })
    }
}

#[async_trait]
impl LockClient for LocalClient {
    async fn acquire(&self, req: &LockRequest) -> Result<bool> {
        self.map.lock(&req.resource, &req.owner, req.lock_type, req.timeout).await
    }

    async fn release(&self, req: &LockRequest) -> Result<()> {
        // Releasing a lock that expired under us is not an error.
        let _ = self.map.unlock(&req.resource, &req.owner, req.lock_type).await;
        Ok(())
    }

    async fn refresh(&self, req: &LockRequest) -> Result<bool> {
        self.map.refresh(&req.resource, &req.owner).await
    }

    async fn is_online(&self) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        true
    }
}

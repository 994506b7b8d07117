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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lease extended by refresh pings; a holder that misses refreshes for
/// this long is expired by the granting side.
pub const LOCK_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Interval between refresh pings while a lock is held.
pub const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// How long acquisition backs off between attempts against a contended
/// resource.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    Read,
    Write,
}

/// One lock request as sent to every peer lock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    /// `<bucket>/<object>` resource path the lock covers.
    pub resource: String,
    /// Unique owner, `<node>:<uuid>` so a restart never reuses one.
    pub owner: String,
    pub lock_type: LockType,
    /// Per-attempt budget, not the overall lease.
    pub timeout: Duration,
}

/// Lock state a peer reports back for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: String,
    pub owner: String,
    pub lock_type: LockType,
    pub since_unix_ms: i64,
}

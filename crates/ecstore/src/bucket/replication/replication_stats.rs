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

//! In-memory replication counters, per bucket and per target ARN. Peers
//! report the same shape; cluster totals are summed per ARN and
//! reconciled against scanner output by taking the maximum so counters
//! never regress when data-usage lags.

use garnetfs_filemeta::{ReplicatedTargetInfo, ReplicationStatusType, ReplicationType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Exponentially weighted transfer rate, updated per completed transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XferStats {
    pub avg_rate: f64,
    pub peak_rate: f64,
    pub curr_rate: f64,
    pub transferred: i64,
}

impl XferStats {
    const ALPHA: f64 = 0.1;

    pub fn add_size(&mut self, size: i64, duration: Duration) {
        if duration.as_secs_f64() <= 0.0 {
            return;
        }
        self.transferred += size;
        self.curr_rate = size as f64 / duration.as_secs_f64();
        self.avg_rate = if self.avg_rate == 0.0 {
            self.curr_rate
        } else {
            Self::ALPHA * self.curr_rate + (1.0 - Self::ALPHA) * self.avg_rate
        };
        if self.curr_rate > self.peak_rate {
            self.peak_rate = self.curr_rate;
        }
    }

    pub fn merge(&self, other: &XferStats) -> XferStats {
        XferStats {
            avg_rate: (self.avg_rate + other.avg_rate) / 2.0,
            peak_rate: self.peak_rate.max(other.peak_rate),
            curr_rate: self.curr_rate + other.curr_rate,
            transferred: self.transferred + other.transferred,
        }
    }
}

/// Sliding-window average of replication latency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStat {
    total_millis: u64,
    count: u64,
}

impl LatencyStat {
    pub fn add(&mut self, duration: Duration) {
        self.total_millis += duration.as_millis() as u64;
        self.count += 1;
    }

    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_millis / self.count)
    }

    pub fn merge(&self, other: &LatencyStat) -> LatencyStat {
        LatencyStat {
            total_millis: self.total_millis + other.total_millis,
            count: self.count + other.count,
        }
    }
}

/// Counters for one target ARN within one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketReplicationStat {
    pub replicated_size: i64,
    pub replicated_count: i64,
    pub failed_size: i64,
    pub failed_count: i64,
    pub pending_size: i64,
    pub pending_count: i64,
    pub latency: LatencyStat,
    pub xfer_rate: XferStats,
}

impl BucketReplicationStat {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            replicated_size: self.replicated_size + other.replicated_size,
            replicated_count: self.replicated_count + other.replicated_count,
            failed_size: self.failed_size + other.failed_size,
            failed_count: self.failed_count + other.failed_count,
            pending_size: self.pending_size + other.pending_size,
            pending_count: self.pending_count + other.pending_count,
            latency: self.latency.merge(&other.latency),
            xfer_rate: self.xfer_rate.merge(&other.xfer_rate),
        }
    }
}

/// Per-bucket aggregate across all targets, plus replica-side counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketReplicationStats {
    pub stats: HashMap<String, BucketReplicationStat>,
    pub replica_size: i64,
    pub replica_count: i64,
    pub queued_size: i64,
    pub queued_count: i64,
}

impl BucketReplicationStats {
    pub fn merge(&self, other: &Self) -> Self {
        let mut stats = self.stats.clone();
        for (arn, stat) in &other.stats {
            let entry = stats.entry(arn.clone()).or_default();
            *entry = entry.merge(stat);
        }
        Self {
            stats,
            replica_size: self.replica_size + other.replica_size,
            replica_count: self.replica_count + other.replica_count,
            queued_size: self.queued_size + other.queued_size,
            queued_count: self.queued_count + other.queued_count,
        }
    }
}

/// Totals a scanner pass reported for one bucket, per target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerReplicationTotals {
    pub replicated_size: HashMap<String, i64>,
    pub replicated_count: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct ReplicationStats {
    cache: RwLock<HashMap<String, BucketReplicationStats>>,
}

impl ReplicationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks an item entering a replication queue.
    pub async fn inc_q(&self, bucket: &str, size: i64, _delete_marker: bool, _op_type: ReplicationType) {
        let mut cache = self.cache.write().await;
        let entry = cache.entry(bucket.to_string()).or_default();
        entry.queued_size += size;
        entry.queued_count += 1;
    }

    pub async fn dec_q(&self, bucket: &str, size: i64, _delete_marker: bool, _op_type: ReplicationType) {
        let mut cache = self.cache.write().await;
        let entry = cache.entry(bucket.to_string()).or_default();
        entry.queued_size -= size;
        entry.queued_count -= 1;
    }

    /// Records the outcome of one attempt against one target.
    pub async fn update(
        &self,
        bucket: &str,
        rinfo: &ReplicatedTargetInfo,
        status: ReplicationStatusType,
        prev_status: ReplicationStatusType,
    ) {
        if rinfo.arn.is_empty() {
            return;
        }

        let mut cache = self.cache.write().await;
        let bucket_stats = cache.entry(bucket.to_string()).or_default();
        let stat = bucket_stats.stats.entry(rinfo.arn.clone()).or_default();

        match status {
            ReplicationStatusType::Pending => {
                if prev_status != ReplicationStatusType::Pending {
                    stat.pending_size += rinfo.size;
                    stat.pending_count += 1;
                }
            }
            ReplicationStatusType::Completed => {
                if prev_status == ReplicationStatusType::Pending {
                    stat.pending_size = (stat.pending_size - rinfo.size).max(0);
                    stat.pending_count = (stat.pending_count - 1).max(0);
                }
                if prev_status != ReplicationStatusType::Completed {
                    stat.replicated_size += rinfo.size;
                    stat.replicated_count += 1;
                    stat.latency.add(rinfo.duration);
                    stat.xfer_rate.add_size(rinfo.size, rinfo.duration);
                }
            }
            ReplicationStatusType::Failed => {
                if prev_status == ReplicationStatusType::Pending {
                    stat.pending_size = (stat.pending_size - rinfo.size).max(0);
                    stat.pending_count = (stat.pending_count - 1).max(0);
                }
                stat.failed_size += rinfo.size;
                stat.failed_count += 1;
            }
            ReplicationStatusType::Replica => {
                bucket_stats.replica_size += rinfo.size;
                bucket_stats.replica_count += 1;
            }
            _ => {}
        }
    }

    pub async fn get(&self, bucket: &str) -> BucketReplicationStats {
        self.cache.read().await.get(bucket).cloned().unwrap_or_default()
    }

    pub async fn get_all(&self) -> HashMap<String, BucketReplicationStats> {
        self.cache.read().await.clone()
    }

    pub async fn delete_bucket(&self, bucket: &str) {
        self.cache.write().await.remove(bucket);
    }

    /// Sums a peer's snapshot into a cluster view.
    pub fn merge_peer(
        cluster: &mut HashMap<String, BucketReplicationStats>,
        peer: &HashMap<String, BucketReplicationStats>,
    ) {
        for (bucket, stats) in peer {
            let entry = cluster.entry(bucket.clone()).or_default();
            *entry = entry.merge(stats);
        }
    }

    /// Reconciles in-memory counters with a scanner pass: for every
    /// target take the maximum, so a lagging scanner can only raise the
    /// numbers, never lower them.
    pub async fn calculate_bucket_replication_stats(
        &self,
        bucket: &str,
        scanner: &ScannerReplicationTotals,
    ) -> BucketReplicationStats {
        let mut stats = self.get(bucket).await;

        for (arn, size) in &scanner.replicated_size {
            let entry = stats.stats.entry(arn.clone()).or_default();
            entry.replicated_size = entry.replicated_size.max(*size);
        }
        for (arn, count) in &scanner.replicated_count {
            let entry = stats.stats.entry(arn.clone()).or_default();
            entry.replicated_count = entry.replicated_count.max(*count);
        }

        stats
    }

    pub fn now() -> SystemTime {
        SystemTime::now()
    }
}

static GLOBAL_REPLICATION_STATS: OnceLock<Arc<ReplicationStats>> = OnceLock::new();

pub fn set_global_replication_stats(stats: Arc<ReplicationStats>) {
    let _ = GLOBAL_REPLICATION_STATS.set(stats);
}

pub fn global_replication_stats() -> Option<Arc<ReplicationStats>> {
    GLOBAL_REPLICATION_STATS.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rinfo(arn: &str, size: i64) -> ReplicatedTargetInfo {
        ReplicatedTargetInfo {
            arn: arn.to_string(),
            size,
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_counts_transitions() {
        let stats = ReplicationStats::new();
        stats
            .update("b", &rinfo("arn:a", 100), ReplicationStatusType::Pending, ReplicationStatusType::Empty)
            .await;
        stats
            .update("b", &rinfo("arn:a", 100), ReplicationStatusType::Completed, ReplicationStatusType::Pending)
            .await;

        let got = stats.get("b").await;
        let stat = &got.stats["arn:a"];
        assert_eq!(stat.replicated_size, 100);
        assert_eq!(stat.replicated_count, 1);
        assert_eq!(stat.pending_count, 0);
        assert!(stat.latency.avg() > Duration::ZERO);

        // A re-completed target does not double count.
        stats
            .update("b", &rinfo("arn:a", 100), ReplicationStatusType::Completed, ReplicationStatusType::Completed)
            .await;
        assert_eq!(stats.get("b").await.stats["arn:a"].replicated_size, 100);
    }

    #[tokio::test]
    async fn test_failed_counts() {
        let stats = ReplicationStats::new();
        stats
            .update("b", &rinfo("arn:a", 40), ReplicationStatusType::Failed, ReplicationStatusType::Pending)
            .await;
        let stat = stats.get("b").await.stats["arn:a"].clone();
        assert_eq!(stat.failed_size, 40);
        assert_eq!(stat.failed_count, 1);
    }

    #[tokio::test]
    async fn test_scanner_reconcile_takes_max() {
        let stats = ReplicationStats::new();
        stats
            .update("b", &rinfo("arn:a", 100), ReplicationStatusType::Completed, ReplicationStatusType::Pending)
            .await;

        // Scanner lags behind: counters hold.
        let scanner = ScannerReplicationTotals {
            replicated_size: HashMap::from([("arn:a".to_string(), 50)]),
            replicated_count: HashMap::from([("arn:a".to_string(), 0)]),
        };
        let got = stats.calculate_bucket_replication_stats("b", &scanner).await;
        assert_eq!(got.stats["arn:a"].replicated_size, 100);

        // Scanner is ahead: counters catch up.
        let scanner = ScannerReplicationTotals {
            replicated_size: HashMap::from([("arn:a".to_string(), 500)]),
            replicated_count: HashMap::from([("arn:a".to_string(), 9)]),
        };
        let got = stats.calculate_bucket_replication_stats("b", &scanner).await;
        assert_eq!(got.stats["arn:a"].replicated_size, 500);
        assert_eq!(got.stats["arn:a"].replicated_count, 9);
    }

    #[tokio::test]
    async fn test_merge_peer_sums() {
        let mut cluster = HashMap::new();
        let mut peer = HashMap::new();
        peer.insert(
            "b".to_string(),
            BucketReplicationStats {
                stats: HashMap::from([(
                    "arn:a".to_string(),
                    BucketReplicationStat {
                        replicated_size: 10,
                        replicated_count: 1,
                        ..Default::default()
                    },
                )]),
                ..Default::default()
            },
        );
        ReplicationStats::merge_peer(&mut cluster, &peer);
        ReplicationStats::merge_peer(&mut cluster, &peer);
        assert_eq!(cluster["b"].stats["arn:a"].replicated_size, 20);
        assert_eq!(cluster["b"].stats["arn:a"].replicated_count, 2);
    }
}

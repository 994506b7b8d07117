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

use crate::replication::{ReplicatedInfos, ReplicationState, ReplicationStatusType, VersionPurgeStatusType};
use crate::{Error, Result};
use garnetfs_utils::http::RESERVED_METADATA_PREFIX_LOWER;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

pub const REPLICATION_RESET: &str = "replication-reset";
pub const REPLICATION_STATUS: &str = "replication-status";
pub const REPLICATION_TIMESTAMP: &str = "replication-timestamp";
pub const REPLICA_STATUS: &str = "replica-status";
pub const REPLICA_TIMESTAMP: &str = "replica-timestamp";
pub const TAGGING_TIMESTAMP: &str = "tagging-timestamp";
pub const OBJECT_LOCK_RETENTION_TIMESTAMP: &str = "objectlock-retention-timestamp";
pub const OBJECT_LOCK_LEGAL_HOLD_TIMESTAMP: &str = "objectlock-legalhold-timestamp";

// Audit trail markers, one per queue an item can travel through.
pub const REPLICATE_QUEUED: &str = "replicate:queue";
pub const REPLICATE_EXISTING: &str = "replicate:existing";
pub const REPLICATE_EXISTING_DELETE: &str = "replicate:existing:delete";
pub const REPLICATE_MRF: &str = "replicate:mrf";
pub const REPLICATE_INCOMING: &str = "replicate:incoming";
pub const REPLICATE_INCOMING_DELETE: &str = "replicate:incoming:delete";
pub const REPLICATE_HEAL: &str = "replicate:heal";
pub const REPLICATE_HEAL_DELETE: &str = "replicate:heal:delete";

/// Entry persisted for the most-recent-failures queue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MrfReplicateEntry {
    #[serde(rename = "bucket")]
    pub bucket: String,

    #[serde(rename = "object")]
    pub object: String,

    #[serde(skip_serializing, skip_deserializing)]
    pub version_id: Option<Uuid>,

    #[serde(rename = "retryCount")]
    pub retry_count: i32,

    #[serde(skip_serializing, skip_deserializing)]
    pub size: i64,
}

/// Work items the replication pool can carry.
pub trait ReplicationWorkerOperation: Send + Sync {
    fn to_mrf_entry(&self) -> MrfReplicateEntry;
    fn get_bucket(&self) -> &str;
    fn get_object(&self) -> &str;
    fn get_size(&self) -> i64;
    fn is_delete_marker(&self) -> bool;
}

/// Per-target replication decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicateTargetDecision {
    pub replicate: bool,
    pub synchronous: bool,
    pub arn: String,
    pub id: String,
}

impl ReplicateTargetDecision {
    pub fn new(arn: String, replicate: bool, sync: bool) -> Self {
        Self {
            replicate,
            synchronous: sync,
            arn,
            id: String::new(),
        }
    }
}

impl fmt::Display for ReplicateTargetDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{};{}", self.replicate, self.synchronous, self.arn, self.id)
    }
}

/// ReplicateDecision maps each target ARN to its replication decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicateDecision {
    pub targets_map: HashMap<String, ReplicateTargetDecision>,
}

impl ReplicateDecision {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if at least one target qualifies for replication.
    pub fn replicate_any(&self) -> bool {
        self.targets_map.values().any(|t| t.replicate)
    }

    /// True if at least one target qualifies for synchronous replication.
    pub fn is_synchronous(&self) -> bool {
        self.targets_map.values().any(|t| t.synchronous)
    }

    pub fn set(&mut self, target: ReplicateTargetDecision) {
        self.targets_map.insert(target.arn.clone(), target);
    }

    /// Internal status string with every replicating target marked PENDING.
    pub fn pending_status(&self) -> Option<String> {
        let mut result = String::new();
        for target in self.targets_map.values() {
            if target.replicate {
                result.push_str(&format!("{}={};", target.arn, ReplicationStatusType::Pending.as_str()));
            }
        }
        if result.is_empty() { None } else { Some(result) }
    }
}

impl fmt::Display for ReplicateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = String::new();
        for (key, value) in &self.targets_map {
            result.push_str(&format!("{key}={value},"));
        }
        write!(f, "{}", result.trim_end_matches(','))
    }
}

/// Parses the `arn=replicate;sync;arn;id,...` form persisted on delete
/// markers back into a ReplicateDecision.
pub fn parse_replicate_decision(s: &str) -> Result<ReplicateDecision> {
    let mut decision = ReplicateDecision::new();

    if s.is_empty() {
        return Ok(decision);
    }

    for pair in s.split(',') {
        if pair.is_empty() {
            continue;
        }

        let kv = pair.split('=').collect::<Vec<&str>>();
        if kv.len() != 2 {
            return Err(Error::other(format!("invalid replicate decision format: {s}")));
        }

        let tgt = kv[1].trim_matches('"').split(';').collect::<Vec<&str>>();
        if tgt.len() != 4 {
            return Err(Error::other(format!("invalid replicate decision format: {s}")));
        }

        decision.targets_map.insert(
            kv[0].to_string(),
            ReplicateTargetDecision {
                replicate: tgt[0] == "true",
                synchronous: tgt[1] == "true",
                arn: tgt[2].to_string(),
                id: tgt[3].to_string(),
            },
        );
    }

    Ok(decision)
}

/// Per-target resync decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResyncTargetDecision {
    pub replicate: bool,
    pub reset_id: String,
    pub reset_before_date: Option<OffsetDateTime>,
}

/// ResyncDecision maps each target ARN to its resync decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResyncDecision {
    pub targets: HashMap<String, ResyncTargetDecision>,
}

impl ResyncDecision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn must_resync(&self) -> bool {
        self.targets.values().any(|v| v.replicate)
    }

    pub fn must_resync_target(&self, tgt_arn: &str) -> bool {
        self.targets.get(tgt_arn).map(|v| v.replicate).unwrap_or(false)
    }
}

/// Metadata key carrying the `ts;resetID` pair for one target.
pub fn target_reset_header(arn: &str) -> String {
    format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_RESET}-{arn}")
}

lazy_static::lazy_static! {
    static ref REPL_STATUS_REGEX: Regex = Regex::new(r"([^=].*?)=([^,].*?);").unwrap();
}

/// Parses an `ARN=Status;ARN=Status;` string into a map.
pub fn replication_statuses_map(s: &str) -> HashMap<String, ReplicationStatusType> {
    let mut targets = HashMap::new();
    for (_, [arn, status]) in REPL_STATUS_REGEX.captures_iter(s).map(|c| c.extract()) {
        if arn.is_empty() {
            continue;
        }
        targets.insert(arn.to_string(), ReplicationStatusType::from(status));
    }
    targets
}

pub fn version_purge_statuses_map(s: &str) -> HashMap<String, VersionPurgeStatusType> {
    let mut targets = HashMap::new();
    for (_, [arn, status]) in REPL_STATUS_REGEX.captures_iter(s).map(|c| c.extract()) {
        if arn.is_empty() {
            continue;
        }
        targets.insert(arn.to_string(), VersionPurgeStatusType::from(status));
    }
    targets
}

/// Status of one target extracted from the internal status string.
pub fn target_replication_status(internal: &str, arn: &str) -> ReplicationStatusType {
    for cap in REPL_STATUS_REGEX.captures_iter(internal) {
        if cap.len() == 3 && &cap[1] == arn {
            return ReplicationStatusType::from(&cap[2]);
        }
    }
    ReplicationStatusType::default()
}

/// Folds the outcome of one replication attempt into the previous state.
pub fn get_replication_state(rinfos: &ReplicatedInfos, prev_state: &ReplicationState) -> ReplicationState {
    let repl_statuses = rinfos.replication_status_internal();
    let vpurge_statuses = rinfos.version_purge_status_internal();

    let mut reset_statuses_map = prev_state.reset_statuses_map.clone();
    for target in rinfos.targets.iter().filter(|t| !t.resync_timestamp.is_empty()) {
        reset_statuses_map.insert(target_reset_header(&target.arn), target.resync_timestamp.clone());
    }

    ReplicationState {
        replicate_decision_str: prev_state.replicate_decision_str.clone(),
        reset_statuses_map,
        replica_timestamp: prev_state.replica_timestamp,
        replica_status: prev_state.replica_status.clone(),
        targets: replication_statuses_map(repl_statuses.as_deref().unwrap_or_default()),
        replication_status_internal: repl_statuses,
        replication_timestamp: rinfos.replication_timestamp,
        purge_targets: version_purge_statuses_map(vpurge_statuses.as_deref().unwrap_or_default()),
        version_purge_status_internal: vpurge_statuses,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicatedTargetInfo;

    #[test]
    fn test_decision_string_round_trip() {
        let mut dsc = ReplicateDecision::new();
        dsc.set(ReplicateTargetDecision::new("arn:a".to_string(), true, false));
        dsc.set(ReplicateTargetDecision::new("arn:b".to_string(), true, true));

        let parsed = parse_replicate_decision(&dsc.to_string()).unwrap();
        assert_eq!(parsed.targets_map.len(), 2);
        assert!(parsed.targets_map["arn:a"].replicate);
        assert!(!parsed.targets_map["arn:a"].synchronous);
        assert!(parsed.targets_map["arn:b"].synchronous);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_replicate_decision("arn:a=true;false").is_err());
        assert!(parse_replicate_decision("garbage").is_err());
        assert!(parse_replicate_decision("").unwrap().targets_map.is_empty());
    }

    #[test]
    fn test_pending_status_skips_non_replicating() {
        let mut dsc = ReplicateDecision::new();
        dsc.set(ReplicateTargetDecision::new("arn:a".to_string(), true, false));
        dsc.set(ReplicateTargetDecision::new("arn:b".to_string(), false, false));
        let pending = dsc.pending_status().unwrap();
        assert!(pending.contains("arn:a=PENDING;"));
        assert!(!pending.contains("arn:b"));
    }

    #[test]
    fn test_statuses_map_parse() {
        let m = replication_statuses_map("arn:a=COMPLETED;arn:b=FAILED;");
        assert_eq!(m["arn:a"], ReplicationStatusType::Completed);
        assert_eq!(m["arn:b"], ReplicationStatusType::Failed);
        assert_eq!(target_replication_status("arn:a=COMPLETED;", "arn:a"), ReplicationStatusType::Completed);
        assert_eq!(target_replication_status("arn:a=COMPLETED;", "arn:x"), ReplicationStatusType::Empty);
    }

    #[test]
    fn test_get_replication_state_merges_resets() {
        let prev = ReplicationState {
            reset_statuses_map: HashMap::from([(target_reset_header("arn:old"), "t0;r0".to_string())]),
            ..Default::default()
        };
        let rinfos = ReplicatedInfos {
            replication_timestamp: Some(OffsetDateTime::UNIX_EPOCH),
            targets: vec![ReplicatedTargetInfo {
                arn: "arn:a".to_string(),
                replication_status: ReplicationStatusType::Completed,
                resync_timestamp: "t1;r1".to_string(),
                ..Default::default()
            }],
        };
        let state = get_replication_state(&rinfos, &prev);
        assert_eq!(state.reset_statuses_map.len(), 2);
        assert_eq!(state.targets["arn:a"], ReplicationStatusType::Completed);
    }
}

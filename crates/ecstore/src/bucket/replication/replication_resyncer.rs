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

//! Existing-object resync: after a target is added or reset, every stored
//! version is walked in ascending name order (so delete markers land
//! after the versions they shadow) and requalified against the target.
//! Progress is checkpointed to `resync.bin` once a minute and resumed
//! after a restart.

use crate::bucket::metadata_sys;
use crate::bucket::replication::config::{ObjectOpts, ReplicationConfiguration};
use crate::bucket::replication::replicate::{
    DeletedObjectReplicationInfo, ReplicateObjectInfo, check_replicate_delete, must_replicate, normalize_legacy_status,
    replicate_delete, replicate_object, MustReplicateOptions,
};
use crate::bucket::target::BucketTargets;
use crate::bucket::target_sys::{BucketTargetSys, StatObjectOptions};
use crate::bucket::versioning_sys::BucketVersioningSys;
use crate::config::com::{read_config, save_config};
use crate::disk::BUCKET_META_PREFIX;
use crate::error::{Error, Result};
use crate::store_api::{ObjectInfo, ObjectOptions, ObjectToDelete, StorageAPI, WalkOptions};
use byteorder::{ByteOrder, LittleEndian};
use garnetfs_filemeta::{
    REPLICATE_EXISTING, REPLICATE_EXISTING_DELETE, ReplicateDecision, ReplicateTargetDecision, ReplicationStatusType,
    ReplicationType, ResyncDecision, ResyncTargetDecision, replication_statuses_map, target_reset_header,
    version_purge_statuses_map,
};
use garnetfs_utils::path::path_join_buf;
use garnetfs_utils::{DEFAULT_SIP_HASH_KEY, sip_hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::time::Duration as TokioDuration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const REPLICATION_DIR: &str = "replication";
const RESYNC_FILE_NAME: &str = "resync.bin";
const RESYNC_META_FORMAT: u16 = 1;
const RESYNC_META_VERSION: u16 = 1;
const RESYNC_TIME_INTERVAL: TokioDuration = TokioDuration::from_secs(60);

pub(crate) const RESYNC_WORKER_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResyncStatusType {
    #[default]
    NoResync,
    ResyncPending,
    ResyncCanceled,
    ResyncStarted,
    ResyncCompleted,
    ResyncFailed,
}

impl ResyncStatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncStatusType::NoResync => "",
            ResyncStatusType::ResyncPending => "Pending",
            ResyncStatusType::ResyncCanceled => "Canceled",
            ResyncStatusType::ResyncStarted => "Started",
            ResyncStatusType::ResyncCompleted => "Completed",
            ResyncStatusType::ResyncFailed => "Failed",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, ResyncStatusType::ResyncPending | ResyncStatusType::ResyncStarted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResyncOpts {
    pub bucket: String,
    pub arn: String,
    pub resync_id: String,
    pub resync_before: Option<OffsetDateTime>,
}

/// Progress record for one target within one bucket's resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetReplicationResyncStatus {
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    pub last_update: Option<OffsetDateTime>,
    pub resync_id: String,
    pub resync_before_date: Option<OffsetDateTime>,
    pub resync_status: ResyncStatusType,
    pub failed_size: i64,
    pub failed_count: i64,
    pub replicated_size: i64,
    pub replicated_count: i64,
    pub bucket: String,
    /// Last object processed, the restart checkpoint.
    pub object: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BucketReplicationResyncStatus {
    pub version: u16,
    pub targets_map: HashMap<String, TargetReplicationResyncStatus>,
    pub id: i32,
    pub last_update: Option<OffsetDateTime>,
}

impl BucketReplicationResyncStatus {
    pub fn new() -> Self {
        Self {
            version: RESYNC_META_VERSION,
            ..Default::default()
        }
    }

    pub fn clone_tgt_stats(&self) -> HashMap<String, TargetReplicationResyncStatus> {
        self.targets_map.clone()
    }

    pub fn marshal_msg(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(Error::other)
    }

    pub fn unmarshal_msg(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(|_| Error::CorruptedFormat)
    }
}

/// Serializes a resync status with the 2-byte format and version header.
pub fn encode_resync_status(status: &BucketReplicationResyncStatus) -> Result<Vec<u8>> {
    let body = status.marshal_msg()?;
    let mut data = Vec::with_capacity(4 + body.len());

    let mut header = [0u8; 2];
    LittleEndian::write_u16(&mut header, RESYNC_META_FORMAT);
    data.extend_from_slice(&header);
    LittleEndian::write_u16(&mut header, RESYNC_META_VERSION);
    data.extend_from_slice(&header);

    data.extend_from_slice(&body);
    Ok(data)
}

pub fn decode_resync_status(data: &[u8]) -> Result<BucketReplicationResyncStatus> {
    if data.is_empty() {
        return Ok(BucketReplicationResyncStatus::new());
    }
    if data.len() <= 4 {
        return Err(Error::CorruptedFormat);
    }

    if LittleEndian::read_u16(&data[0..2]) != RESYNC_META_FORMAT {
        return Err(Error::CorruptedFormat);
    }
    if LittleEndian::read_u16(&data[2..4]) != RESYNC_META_VERSION {
        return Err(Error::CorruptedFormat);
    }

    let status = BucketReplicationResyncStatus::unmarshal_msg(&data[4..])?;
    if status.version != RESYNC_META_VERSION {
        return Err(Error::CorruptedFormat);
    }
    Ok(status)
}

fn resync_config_path(bucket: &str) -> String {
    path_join_buf(&[BUCKET_META_PREFIX, bucket, REPLICATION_DIR, RESYNC_FILE_NAME])
}

pub async fn save_resync_status<S: StorageAPI>(bucket: &str, status: &BucketReplicationResyncStatus, api: Arc<S>) -> Result<()> {
    let data = encode_resync_status(status)?;
    save_config(api, &resync_config_path(bucket), data).await
}

pub async fn load_bucket_resync_metadata<S: StorageAPI>(bucket: &str, api: Arc<S>) -> Result<BucketReplicationResyncStatus> {
    let data = match read_config(api, &resync_config_path(bucket)).await {
        Ok(data) => data,
        Err(Error::ConfigNotFound) => return Ok(BucketReplicationResyncStatus::new()),
        Err(err) => return Err(err),
    };
    decode_resync_status(&data)
}

/// Drives existing-object replication for every bucket with a pending or
/// requested resync.
#[derive(Debug)]
pub struct ReplicationResyncer {
    pub status_map: Arc<RwLock<HashMap<String, BucketReplicationResyncStatus>>>,
    workers: Arc<Semaphore>,
    resync_cancel: CancellationToken,
}

impl Default for ReplicationResyncer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationResyncer {
    pub fn new() -> Self {
        Self {
            status_map: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(RESYNC_WORKER_COUNT)),
            resync_cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_all(&self) {
        self.resync_cancel.cancel();
    }

    /// Writes one target's status transition through to resync.bin.
    pub async fn mark_status<S: StorageAPI>(&self, status: ResyncStatusType, opts: &ResyncOpts, api: Arc<S>) -> Result<()> {
        let snapshot = {
            let mut status_map = self.status_map.write().await;
            let bucket_status = status_map
                .entry(opts.bucket.clone())
                .or_insert_with(BucketReplicationResyncStatus::new);

            let state = bucket_status.targets_map.entry(opts.arn.clone()).or_default();
            state.resync_status = status;
            state.last_update = Some(OffsetDateTime::now_utc());
            if status == ResyncStatusType::ResyncStarted && state.start_time.is_none() {
                state.start_time = Some(OffsetDateTime::now_utc());
                state.resync_id = opts.resync_id.clone();
                state.resync_before_date = opts.resync_before;
            }
            if matches!(
                status,
                ResyncStatusType::ResyncCompleted | ResyncStatusType::ResyncFailed | ResyncStatusType::ResyncCanceled
            ) {
                state.end_time = Some(OffsetDateTime::now_utc());
            }

            bucket_status.last_update = Some(OffsetDateTime::now_utc());
            bucket_status.clone()
        };

        save_resync_status(&opts.bucket, &snapshot, api).await
    }

    /// Folds one worker's increments into the in-memory map; held only
    /// for the duration of the update, never across IO.
    pub async fn inc_stats(&self, status: &TargetReplicationResyncStatus, opts: &ResyncOpts) {
        let mut status_map = self.status_map.write().await;
        let bucket_status = status_map
            .entry(opts.bucket.clone())
            .or_insert_with(BucketReplicationResyncStatus::new);
        let state = bucket_status.targets_map.entry(opts.arn.clone()).or_default();

        state.object = status.object.clone();
        state.replicated_count += status.replicated_count;
        state.replicated_size += status.replicated_size;
        state.failed_count += status.failed_count;
        state.failed_size += status.failed_size;
        state.last_update = Some(OffsetDateTime::now_utc());
        bucket_status.last_update = Some(OffsetDateTime::now_utc());
    }

    /// Checkpoint loop: persists any bucket whose state moved since the
    /// previous tick.
    pub async fn persist_to_disk<S: StorageAPI>(self: Arc<Self>, cancel_token: CancellationToken, api: Arc<S>) {
        let mut interval = tokio::time::interval(RESYNC_TIME_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_saved: HashMap<String, OffsetDateTime> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return,
                _ = interval.tick() => {
                    let snapshot = self.status_map.read().await.clone();
                    for (bucket, status) in snapshot {
                        let Some(last_update) = status.last_update else {
                            continue;
                        };
                        if last_saved.get(&bucket).map(|t| *t >= last_update).unwrap_or(false) {
                            continue;
                        }
                        match save_resync_status(&bucket, &status, api.clone()).await {
                            Ok(()) => {
                                last_saved.insert(bucket, last_update);
                            }
                            Err(err) => error!("failed to checkpoint resync status for {}: {}", bucket, err),
                        }
                    }
                }
            }
        }
    }

    async fn mark_and_release<S: StorageAPI>(&self, status: ResyncStatusType, opts: &ResyncOpts, api: Arc<S>) {
        if let Err(err) = self.mark_status(status, opts, api).await {
            error!("failed to mark resync status for {}: {}", opts.bucket, err);
        }
    }

    /// Validates and kicks off a resync for one target. Refuses when one
    /// is already running for the same ARN.
    pub async fn start<S: StorageAPI>(
        self: Arc<Self>,
        cancel_token: CancellationToken,
        api: Arc<S>,
        opts: ResyncOpts,
    ) -> Result<()> {
        let (cfg, _) = metadata_sys::get_replication_config(&opts.bucket).await?;
        let arns = cfg.filter_target_arns(&ObjectOpts {
            op_type: ReplicationType::Resync,
            target_arn: opts.arn.clone(),
            ..Default::default()
        });
        if arns.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "replication resync failed for {}: arn {} missing in the replication config",
                opts.bucket, opts.arn
            )));
        }

        {
            let status_map = self.status_map.read().await;
            if let Some(state) = status_map.get(&opts.bucket).and_then(|s| s.targets_map.get(&opts.arn)) {
                if state.resync_status == ResyncStatusType::ResyncStarted {
                    return Err(Error::InvalidArgument(format!(
                        "replication resync already in progress for {} ({})",
                        opts.bucket, opts.arn
                    )));
                }
            }
        }

        self.mark_status(ResyncStatusType::ResyncStarted, &opts, api.clone()).await?;

        let resyncer = self.clone();
        tokio::spawn(async move {
            resyncer.resync_bucket(cancel_token, api, false, opts).await;
        });

        Ok(())
    }

    /// Walks the bucket and replicates everything the per-target resync
    /// predicate selects. `heal` resumes from the persisted checkpoint.
    pub async fn resync_bucket<S: StorageAPI>(
        self: Arc<Self>,
        cancel_token: CancellationToken,
        api: Arc<S>,
        heal: bool,
        opts: ResyncOpts,
    ) {
        // Bound concurrent bucket resyncs across the process.
        let _permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let cfg = match metadata_sys::get_replication_config(&opts.bucket).await {
            Ok((cfg, _)) => cfg,
            Err(err) => {
                error!("resync: no replication config for {}: {}", opts.bucket, err);
                self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
                return;
            }
        };

        let targets = match BucketTargetSys::get().list_bucket_targets(&opts.bucket).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!("resync: failed to list bucket targets for {}: {}", opts.bucket, err);
                self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
                return;
            }
        };

        let rcfg = ReplicationConfig::new(Some(cfg.clone()), Some(targets));

        let target_arns = cfg.filter_target_arns(&ObjectOpts {
            op_type: ReplicationType::Resync,
            target_arn: opts.arn.clone(),
            ..Default::default()
        });
        if target_arns.len() != 1 {
            error!(
                "resync failed for {}: arn {} missing in the replication config",
                opts.bucket, opts.arn
            );
            self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
            return;
        }

        let Some(target_client) = BucketTargetSys::get()
            .get_remote_target_client(&opts.bucket, &target_arns[0])
            .await
        else {
            error!("resync failed for {}: arn {} missing in bucket targets", opts.bucket, opts.arn);
            self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
            return;
        };

        if !heal {
            if let Err(err) = self.mark_status(ResyncStatusType::ResyncStarted, &opts, api.clone()).await {
                error!("resync: failed to mark started: {}", err);
            }
        }

        // Resume from the last processed object when continuing a
        // previously interrupted pass.
        let last_checkpoint = if heal {
            let status_map = self.status_map.read().await;
            status_map
                .get(&opts.bucket)
                .and_then(|s| s.targets_map.get(&opts.arn))
                .filter(|s| {
                    matches!(s.resync_status, ResyncStatusType::ResyncStarted | ResyncStatusType::ResyncFailed)
                        && !s.object.is_empty()
                })
                .map(|s| s.object.clone())
        } else {
            None
        };

        let (walk_tx, mut walk_rx) = mpsc::channel(100);
        if let Err(err) = api
            .walk(
                cancel_token.clone(),
                &opts.bucket,
                "",
                walk_tx,
                WalkOptions {
                    marker: last_checkpoint,
                    ..Default::default()
                },
            )
            .await
        {
            error!("resync: failed to walk bucket {}: {}", opts.bucket, err);
            self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
            return;
        }

        // Results fan-in.
        let (results_tx, mut results_rx) = mpsc::channel::<TargetReplicationResyncStatus>(100);
        let results_opts = opts.clone();
        let results_self = self.clone();
        let results_task = tokio::spawn(async move {
            while let Some(status) = results_rx.recv().await {
                results_self.inc_stats(&status, &results_opts).await;
            }
        });

        // Per-object workers keyed by name hash so versions of one object
        // stay ordered.
        let mut worker_txs = Vec::with_capacity(RESYNC_WORKER_COUNT);
        let mut worker_tasks = Vec::with_capacity(RESYNC_WORKER_COUNT);
        for _ in 0..RESYNC_WORKER_COUNT {
            let (tx, mut rx) = mpsc::channel::<ReplicateObjectInfo>(100);
            worker_txs.push(tx);

            let cancel = cancel_token.clone();
            let resync_cancel = self.resync_cancel.clone();
            let api = api.clone();
            let results_tx = results_tx.clone();
            let target_client = target_client.clone();

            worker_tasks.push(tokio::spawn(async move {
                while let Some(mut roi) = rx.recv().await {
                    if cancel.is_cancelled() || resync_cancel.is_cancelled() {
                        return;
                    }

                    if roi.delete_marker || !roi.version_purge_status.is_empty() {
                        let (version_id, dm_version_id) = if roi.version_purge_status.is_empty() {
                            (None, roi.version_id)
                        } else {
                            (roi.version_id, None)
                        };

                        let doi = DeletedObjectReplicationInfo {
                            delete_object: crate::store_api::DeletedObject {
                                object_name: roi.name.clone(),
                                delete_marker_version_id: dm_version_id,
                                version_id,
                                replication_state: roi.replication_state.clone(),
                                delete_marker: roi.delete_marker,
                                delete_marker_mtime: roi.mod_time,
                                ..Default::default()
                            },
                            bucket: roi.bucket.clone(),
                            event_type: REPLICATE_EXISTING_DELETE.to_string(),
                            op_type: ReplicationType::ExistingObject,
                            ..Default::default()
                        };
                        replicate_delete(doi, api.clone()).await;
                    } else {
                        roi.op_type = ReplicationType::ExistingObject;
                        roi.event_type = REPLICATE_EXISTING.to_string();
                        replicate_object(roi.clone(), api.clone()).await;
                    }

                    let mut status = TargetReplicationResyncStatus {
                        object: roi.name.clone(),
                        bucket: roi.bucket.clone(),
                        ..Default::default()
                    };

                    // Confirm against the target; a delete marker is
                    // expected to be absent there.
                    match target_client
                        .api
                        .head_object(
                            &target_client.bucket,
                            &roi.name,
                            &StatObjectOptions {
                                version_id: roi.version_id.map(|v| v.to_string()).unwrap_or_default(),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        Ok(_) => {
                            status.replicated_count += 1;
                            status.replicated_size += roi.size;
                        }
                        Err(_) if roi.delete_marker => {
                            status.replicated_count += 1;
                        }
                        Err(err) => {
                            status.failed_count += 1;
                            status.failed_size += roi.size;
                            info!("resync of {}/{} not yet visible on target: {}", roi.bucket, roi.name, err);
                        }
                    }

                    if results_tx.send(status).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(results_tx);

        while let Some(res) = walk_rx.recv().await {
            if let Some(err) = res.err {
                error!("resync walk error for {}: {}", opts.bucket, err);
                self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
                return;
            }

            if self.resync_cancel.is_cancelled() {
                self.mark_and_release(ResyncStatusType::ResyncCanceled, &opts, api.clone()).await;
                return;
            }
            if cancel_token.is_cancelled() {
                self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
                return;
            }

            let Some(object) = res.item else {
                continue;
            };

            let roi = get_heal_replicate_object_info(&object, &rcfg).await;
            if !roi.existing_obj_resync.must_resync() {
                continue;
            }

            let worker_idx = sip_hash(&roi.name, RESYNC_WORKER_COUNT, &DEFAULT_SIP_HASH_KEY);
            if worker_txs[worker_idx].send(roi).await.is_err() {
                error!("resync worker channel closed for {}", opts.bucket);
                self.mark_and_release(ResyncStatusType::ResyncFailed, &opts, api.clone()).await;
                return;
            }
        }

        drop(worker_txs);
        for task in worker_tasks {
            let _ = task.await;
        }
        let _ = results_task.await;

        self.mark_and_release(ResyncStatusType::ResyncCompleted, &opts, api.clone()).await;
    }

    /// Loads persisted resync state for every bucket and resumes passes
    /// that were interrupted.
    pub async fn load_resync<S: StorageAPI>(
        self: Arc<Self>,
        cancel_token: CancellationToken,
        api: Arc<S>,
        buckets: &[String],
    ) -> Result<()> {
        for bucket in buckets {
            let meta = match load_bucket_resync_metadata(bucket, api.clone()).await {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("failed to load resync metadata for {}: {}", bucket, err);
                    continue;
                }
            };

            {
                let mut status_map = self.status_map.write().await;
                status_map.insert(bucket.clone(), meta.clone());
            }

            for (arn, stats) in meta.clone_tgt_stats() {
                if matches!(
                    stats.resync_status,
                    ResyncStatusType::ResyncFailed | ResyncStatusType::ResyncStarted | ResyncStatusType::ResyncPending
                ) {
                    let resyncer = self.clone();
                    let api = api.clone();
                    let cancel = cancel_token.clone();
                    let opts = ResyncOpts {
                        bucket: bucket.clone(),
                        arn,
                        resync_id: stats.resync_id,
                        resync_before: stats.resync_before_date,
                    };
                    tokio::spawn(async move {
                        resyncer.resync_bucket(cancel, api, true, opts).await;
                    });
                }
            }
        }

        Ok(())
    }
}

/// Bucket replication config paired with its remote targets, the view the
/// resync predicate needs.
#[derive(Debug, Clone, Default)]
pub struct ReplicationConfig {
    pub config: Option<ReplicationConfiguration>,
    pub remotes: Option<BucketTargets>,
}

impl ReplicationConfig {
    pub fn new(config: Option<ReplicationConfiguration>, remotes: Option<BucketTargets>) -> Self {
        Self { config, remotes }
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_none()
    }

    pub fn replicate(&self, obj: &ObjectOpts) -> bool {
        self.config.as_ref().is_some_and(|config| config.replicate(obj))
    }

    /// Existing-object resync decision for one version across all
    /// configured remotes.
    pub async fn resync(
        &self,
        oi: &ObjectInfo,
        dsc: ReplicateDecision,
        status: &HashMap<String, ReplicationStatusType>,
    ) -> ResyncDecision {
        if self.is_empty() {
            return ResyncDecision::default();
        }

        let mut dsc = dsc;

        if oi.delete_marker {
            let opts = ObjectOpts {
                name: oi.name.clone(),
                version_id: oi.version_id,
                delete_marker: true,
                op_type: ReplicationType::Delete,
                existing_object: true,
                ..Default::default()
            };
            let arns = self
                .config
                .as_ref()
                .map(|config| config.filter_target_arns(&opts))
                .unwrap_or_default();

            if arns.is_empty() {
                return ResyncDecision::default();
            }

            for arn in arns {
                let mut opts = opts.clone();
                opts.target_arn = arn;
                dsc.set(ReplicateTargetDecision::new(opts.target_arn.clone(), self.replicate(&opts), false));
            }

            return self.resync_internal(oi, dsc, status);
        }

        let mut user_defined = oi.user_defined.clone();
        user_defined.remove(garnetfs_utils::http::AMZ_BUCKET_REPLICATION_STATUS);

        let dsc = must_replicate(
            &oi.bucket,
            &oi.name,
            MustReplicateOptions::new(
                &user_defined,
                oi.user_tags.clone(),
                ReplicationStatusType::Empty,
                ReplicationType::ExistingObject,
                &ObjectOptions::default(),
            ),
        )
        .await;

        self.resync_internal(oi, dsc, status)
    }

    fn resync_internal(
        &self,
        oi: &ObjectInfo,
        dsc: ReplicateDecision,
        status: &HashMap<String, ReplicationStatusType>,
    ) -> ResyncDecision {
        let Some(remotes) = self.remotes.as_ref() else {
            return ResyncDecision::default();
        };
        if remotes.is_empty() {
            return ResyncDecision::default();
        }

        let mut decision = ResyncDecision::default();
        for target in remotes.targets.iter() {
            if let Some(target_decision) = dsc.targets_map.get(&target.arn) {
                if target_decision.replicate {
                    decision.targets.insert(
                        target_decision.arn.clone(),
                        resync_target(
                            oi,
                            &target.arn,
                            &target.reset_id,
                            target.reset_before_date,
                            status.get(&target_decision.arn).cloned().unwrap_or_default(),
                        ),
                    );
                }
            }
        }

        decision
    }
}

/// Per-target resync predicate over the object's reset header:
/// - no reset header and empty status: replicate,
/// - current reset already recorded and target completed: skip,
/// - otherwise replicate when the version predates the reset cutoff.
pub fn resync_target(
    oi: &ObjectInfo,
    arn: &str,
    reset_id: &str,
    reset_before_date: Option<OffsetDateTime>,
    status: ReplicationStatusType,
) -> ResyncTargetDecision {
    let reset_header = oi.user_defined.get(target_reset_header(arn).as_str()).map(|s| s.to_string());

    let mut dec = ResyncTargetDecision::default();
    let mod_time = oi.mod_time.unwrap_or(OffsetDateTime::UNIX_EPOCH);

    let Some(reset_header) = reset_header else {
        let cutoff = reset_before_date.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        if !reset_id.is_empty() && mod_time < cutoff {
            dec.replicate = true;
            return dec;
        }
        dec.replicate = status == ReplicationStatusType::Empty;
        return dec;
    };

    if reset_id.is_empty() || reset_before_date.is_none() {
        return dec;
    }

    let parts: Vec<&str> = reset_header.splitn(2, ';').collect();
    if parts.len() != 2 {
        return dec;
    }

    // The header records `ts;resetID`; the id is the second field.
    let recorded_reset = parts[1] == reset_id;
    if recorded_reset && status == ReplicationStatusType::Completed {
        return dec;
    }
    if !recorded_reset && status == ReplicationStatusType::Completed {
        // A different (older) reset completed; requalify under the
        // current one.
        dec.replicate = mod_time < reset_before_date.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        return dec;
    }

    dec.replicate = mod_time < reset_before_date.unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dec
}

/// Builds the work item for a heal or resync candidate from its resolved
/// object info.
pub async fn get_heal_replicate_object_info(oi: &ObjectInfo, rcfg: &ReplicationConfig) -> ReplicateObjectInfo {
    let mut oi = oi.clone();

    if let Some(config) = rcfg.config.as_ref() {
        normalize_legacy_status(&mut oi, config);
    }

    let dsc = if oi.delete_marker || !oi.version_purge_status.is_empty() {
        check_replicate_delete(
            &oi.bucket.clone(),
            &ObjectToDelete {
                object_name: oi.name.clone(),
                version_id: oi.version_id,
                ..Default::default()
            },
            &oi,
            &ObjectOptions {
                versioned: BucketVersioningSys::prefix_enabled(&oi.bucket, &oi.name).await,
                version_suspended: BucketVersioningSys::prefix_suspended(&oi.bucket, &oi.name).await,
                ..Default::default()
            },
            None,
        )
        .await
    } else {
        must_replicate(
            &oi.bucket.clone(),
            &oi.name.clone(),
            MustReplicateOptions::new(
                &oi.user_defined,
                oi.user_tags.clone(),
                ReplicationStatusType::Empty,
                ReplicationType::Heal,
                &ObjectOptions::default(),
            ),
        )
        .await
    };

    let target_statuses = replication_statuses_map(oi.replication_status_internal.as_deref().unwrap_or_default());
    let target_purge_statuses = version_purge_statuses_map(oi.version_purge_status_internal.as_deref().unwrap_or_default());
    let existing_obj_resync = rcfg.resync(&oi, dsc.clone(), &target_statuses).await;

    let mut replication_state = oi.replication_state();
    replication_state.replicate_decision_str = dsc.to_string();
    let actual_size = oi.get_actual_size().unwrap_or_default();

    ReplicateObjectInfo {
        name: oi.name.clone(),
        size: oi.size,
        actual_size,
        bucket: oi.bucket.clone(),
        version_id: oi.version_id,
        etag: oi.etag.clone(),
        mod_time: oi.mod_time,
        replication_status: oi.replication_status.clone(),
        replication_status_internal: oi.replication_status_internal.clone(),
        delete_marker: oi.delete_marker,
        version_purge_status_internal: oi.version_purge_status_internal.clone(),
        version_purge_status: oi.version_purge_status.clone(),
        replication_state: Some(replication_state),
        op_type: ReplicationType::Heal,
        dsc,
        existing_obj_resync,
        target_statuses,
        target_purge_statuses,
        user_tags: oi.user_tags.clone(),
        ..Default::default()
    }
}

/// Generates a fresh resync request id.
pub fn new_resync_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_status_codec_round_trip() {
        let mut status = BucketReplicationResyncStatus::new();
        status.targets_map.insert(
            "arn:a".to_string(),
            TargetReplicationResyncStatus {
                resync_id: "r1".to_string(),
                resync_status: ResyncStatusType::ResyncStarted,
                replicated_count: 42,
                object: "objects/000123".to_string(),
                bucket: "b".to_string(),
                ..Default::default()
            },
        );

        let data = encode_resync_status(&status).unwrap();
        assert_eq!(LittleEndian::read_u16(&data[0..2]), RESYNC_META_FORMAT);

        let got = decode_resync_status(&data).unwrap();
        assert_eq!(got.targets_map["arn:a"].replicated_count, 42);
        assert_eq!(got.targets_map["arn:a"].object, "objects/000123");
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        assert!(decode_resync_status(&[9, 9, 0, 0, 1]).is_err());
        assert!(decode_resync_status(&[1]).is_err());
        assert!(decode_resync_status(&[]).unwrap().targets_map.is_empty());
    }

    fn oi_with(mod_time: i64, reset_header: Option<(&str, &str)>) -> ObjectInfo {
        let mut oi = ObjectInfo {
            mod_time: Some(OffsetDateTime::from_unix_timestamp(mod_time).unwrap()),
            ..Default::default()
        };
        if let Some((arn, value)) = reset_header {
            oi.user_defined.insert(target_reset_header(arn), value.to_string());
        }
        oi
    }

    #[test]
    fn test_resync_target_no_header_empty_status() {
        let oi = oi_with(100, None);
        let dec = resync_target(&oi, "arn:a", "", None, ReplicationStatusType::Empty);
        assert!(dec.replicate);

        let dec = resync_target(&oi, "arn:a", "", None, ReplicationStatusType::Completed);
        assert!(!dec.replicate);
    }

    #[test]
    fn test_resync_target_reset_cutoff() {
        let cutoff = OffsetDateTime::from_unix_timestamp(200).unwrap();
        let oi = oi_with(100, None);
        let dec = resync_target(&oi, "arn:a", "reset1", Some(cutoff), ReplicationStatusType::Completed);
        assert!(dec.replicate);

        let newer = oi_with(300, None);
        let dec = resync_target(&newer, "arn:a", "reset1", Some(cutoff), ReplicationStatusType::Completed);
        assert!(!dec.replicate);
    }

    #[test]
    fn test_resync_target_skips_current_reset_completed() {
        let cutoff = OffsetDateTime::from_unix_timestamp(200).unwrap();
        let oi = oi_with(100, Some(("arn:a", "2024-01-01T00:00:00Z;reset1")));
        let dec = resync_target(&oi, "arn:a", "reset1", Some(cutoff), ReplicationStatusType::Completed);
        assert!(!dec.replicate);

        // A new reset id requalifies the version.
        let dec = resync_target(&oi, "arn:a", "reset2", Some(cutoff), ReplicationStatusType::Completed);
        assert!(dec.replicate);
    }
}

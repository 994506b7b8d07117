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

//! Replication decisions and the per-object / per-delete replication
//! paths. Decisions are pure functions over object metadata and bucket
//! configuration; execution fans out per target and writes the aggregated
//! outcome back through a metadata-only PUT.

use crate::bucket::metadata_sys;
use crate::bucket::replication::config::{ObjectOpts, ReplicationConfiguration, decode_tags_to_map};
use crate::bucket::replication::replication_pool;
use crate::bucket::replication::replication_stats::global_replication_stats;
use crate::bucket::target_sys::{
    BucketTargetSys, CompletedPart, CopyObjectOptions, PutObjectOptions, PutObjectPartOptions, RemoteObjectInfo,
    RemoveObjectOptions, StatObjectOptions, TargetClient,
};
use crate::bucket::versioning_sys::BucketVersioningSys;
use crate::error::{Error, Result, is_err_object_not_found, is_err_version_not_found};
use crate::event_notification::{EventArgs, EventName, send_event};
use crate::global::{global_local_node_name, new_object_layer_fn};
use crate::store_api::{DeletedObject, ObjectInfo, ObjectOptions, ObjectToDelete, StorageAPI};
use garnetfs_filemeta::{
    MrfReplicateEntry, REPLICATE_MRF, REPLICATION_RESET, REPLICATION_STATUS, REPLICATION_TIMESTAMP, ReplicateDecision,
    ReplicateTargetDecision, ReplicatedInfos, ReplicatedTargetInfo, ReplicationAction, ReplicationState, ReplicationStatusType,
    ReplicationType, ReplicationWorkerOperation, ResyncDecision, TAGGING_TIMESTAMP, VersionPurgeStatusType,
    parse_replicate_decision, replication_statuses_map, target_replication_status, target_reset_header,
    version_purge_statuses_map,
};
use garnetfs_utils::http::headers;
use garnetfs_utils::http::{AMZ_BUCKET_REPLICATION_STATUS, AMZ_OBJECT_TAGGING, RESERVED_METADATA_PREFIX_LOWER};
use garnetfs_utils::path::trim_etag;
use garnetfs_utils::strings_has_prefix_fold;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::{error, warn};
use uuid::Uuid;

/// Lock keyspace for replication so it never contends with normal reads.
pub fn replicate_lock_key(object: &str) -> String {
    format!("/[replicate]/{object}")
}

async fn get_replication_config(bucket: &str) -> Result<Option<ReplicationConfiguration>> {
    match metadata_sys::get_replication_config(bucket).await {
        Ok((config, _)) => Ok(Some(config)),
        Err(Error::ConfigNotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

/// One queued object replication work item.
#[derive(Debug, Clone, Default)]
pub struct ReplicateObjectInfo {
    pub name: String,
    pub size: i64,
    pub actual_size: i64,
    pub bucket: String,
    pub version_id: Option<Uuid>,
    pub etag: Option<String>,
    pub mod_time: Option<OffsetDateTime>,
    pub replication_status: ReplicationStatusType,
    pub replication_status_internal: Option<String>,
    pub delete_marker: bool,
    pub version_purge_status_internal: Option<String>,
    pub version_purge_status: VersionPurgeStatusType,
    pub replication_state: Option<ReplicationState>,
    pub op_type: ReplicationType,
    pub event_type: String,
    pub dsc: ReplicateDecision,
    pub existing_obj_resync: ResyncDecision,
    pub target_statuses: HashMap<String, ReplicationStatusType>,
    pub target_purge_statuses: HashMap<String, VersionPurgeStatusType>,
    pub replication_timestamp: Option<OffsetDateTime>,
    pub ssec: bool,
    pub user_tags: String,
    pub retry_count: u32,
    pub target_arn: String,
}

impl ReplicateObjectInfo {
    pub fn target_replication_status(&self, arn: &str) -> ReplicationStatusType {
        target_replication_status(self.replication_status_internal.as_deref().unwrap_or_default(), arn)
    }

    pub fn to_object_info(&self) -> ObjectInfo {
        ObjectInfo {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            mod_time: self.mod_time,
            version_id: self.version_id,
            size: self.size,
            actual_size: self.actual_size,
            user_tags: self.user_tags.clone(),
            etag: self.etag.clone(),
            delete_marker: self.delete_marker,
            replication_status_internal: self.replication_status_internal.clone(),
            replication_status: self.replication_status.clone(),
            version_purge_status_internal: self.version_purge_status_internal.clone(),
            version_purge_status: self.version_purge_status.clone(),
            ..Default::default()
        }
    }
}

impl ReplicationWorkerOperation for ReplicateObjectInfo {
    fn to_mrf_entry(&self) -> MrfReplicateEntry {
        MrfReplicateEntry {
            bucket: self.bucket.clone(),
            object: self.name.clone(),
            version_id: self.version_id,
            retry_count: self.retry_count as i32,
            size: self.size,
        }
    }

    fn get_bucket(&self) -> &str {
        &self.bucket
    }

    fn get_object(&self) -> &str {
        &self.name
    }

    fn get_size(&self) -> i64 {
        self.size
    }

    fn is_delete_marker(&self) -> bool {
        self.delete_marker
    }
}

/// One queued delete replication work item.
#[derive(Debug, Clone, Default)]
pub struct DeletedObjectReplicationInfo {
    pub delete_object: DeletedObject,
    pub bucket: String,
    pub event_type: String,
    pub op_type: ReplicationType,
    pub reset_id: String,
    pub target_arn: String,
}

impl ReplicationWorkerOperation for DeletedObjectReplicationInfo {
    fn to_mrf_entry(&self) -> MrfReplicateEntry {
        MrfReplicateEntry {
            bucket: self.bucket.clone(),
            object: self.delete_object.object_name.clone(),
            version_id: None,
            retry_count: 0,
            size: 0,
        }
    }

    fn get_bucket(&self) -> &str {
        &self.bucket
    }

    fn get_object(&self) -> &str {
        &self.delete_object.object_name
    }

    fn get_size(&self) -> i64 {
        0
    }

    fn is_delete_marker(&self) -> bool {
        true
    }
}

pub struct MustReplicateOptions {
    pub meta: HashMap<String, String>,
    pub status: ReplicationStatusType,
    pub op_type: ReplicationType,
    pub replication_request: bool,
}

impl MustReplicateOptions {
    pub fn new(
        meta: &HashMap<String, String>,
        user_tags: String,
        status: ReplicationStatusType,
        op_type: ReplicationType,
        opts: &ObjectOptions,
    ) -> Self {
        let mut meta = meta.clone();
        if !user_tags.is_empty() {
            meta.insert(AMZ_OBJECT_TAGGING.to_string(), user_tags);
        }

        Self {
            meta,
            status,
            op_type,
            replication_request: opts.replication_request,
        }
    }

    pub fn from_object_info(oi: &ObjectInfo, op_type: ReplicationType, opts: &ObjectOptions) -> Self {
        Self::new(&oi.user_defined, oi.user_tags.clone(), oi.replication_status.clone(), op_type, opts)
    }

    pub fn replication_status(&self) -> ReplicationStatusType {
        if let Some(rs) = self.meta.get(AMZ_BUCKET_REPLICATION_STATUS) {
            return ReplicationStatusType::from(rs.as_str());
        }
        self.status.clone()
    }

    pub fn is_existing_object_replication(&self) -> bool {
        self.op_type == ReplicationType::ExistingObject
    }

    pub fn is_metadata_replication(&self) -> bool {
        self.op_type == ReplicationType::Metadata
    }
}

/// Consulted on every write and metadata mutation: which targets should
/// this version replicate to, and synchronously or not.
pub async fn must_replicate(bucket: &str, object: &str, mopts: MustReplicateOptions) -> ReplicateDecision {
    if new_object_layer_fn().is_none() {
        return ReplicateDecision::default();
    }

    // Versioning-suspended prefixes are never replicated.
    if !BucketVersioningSys::prefix_enabled(bucket, object).await {
        return ReplicateDecision::default();
    }

    let replication_status = mopts.replication_status();

    // Never re-replicate a replica, except for metadata sync.
    if replication_status == ReplicationStatusType::Replica && !mopts.is_metadata_replication() {
        return ReplicateDecision::default();
    }

    // A version that already replicated everywhere has nothing to queue;
    // metadata sync, heal and resync paths requalify on their own terms.
    if replication_status == ReplicationStatusType::Completed
        && !mopts.is_metadata_replication()
        && !mopts.is_existing_object_replication()
        && mopts.op_type != ReplicationType::Heal
    {
        return ReplicateDecision::default();
    }

    if mopts.replication_request {
        return ReplicateDecision::default();
    }

    let Ok(Some(cfg)) = get_replication_config(bucket).await else {
        return ReplicateDecision::default();
    };

    let mut opts = ObjectOpts {
        name: object.to_string(),
        replica: replication_status == ReplicationStatusType::Replica,
        existing_object: mopts.is_existing_object_replication(),
        user_tags: mopts.meta.get(AMZ_OBJECT_TAGGING).cloned().unwrap_or_default(),
        op_type: mopts.op_type,
        ..Default::default()
    };

    let arns = cfg.filter_target_arns(&opts);
    if arns.is_empty() {
        return ReplicateDecision::default();
    }

    let mut dsc = ReplicateDecision::default();
    for arn in arns {
        let client = BucketTargetSys::get().get_remote_target_client(bucket, &arn).await;

        // The target's online state is deliberately not consulted here;
        // a temporarily unreachable target still gets a Pending entry.
        opts.target_arn = arn.clone();
        let replicate = cfg.replicate(&opts);
        let synchronous = client.map(|c| c.replicate_sync).unwrap_or(false);

        dsc.set(ReplicateTargetDecision::new(arn, replicate, synchronous));
    }

    dsc
}

/// Consulted on every delete: whether the delete (hard version delete or
/// delete marker) should be forwarded per target.
pub async fn check_replicate_delete(
    bucket: &str,
    dobj: &ObjectToDelete,
    oi: &ObjectInfo,
    del_opts: &ObjectOptions,
    gerr: Option<&Error>,
) -> ReplicateDecision {
    let Ok(Some(rcfg)) = get_replication_config(bucket).await else {
        return ReplicateDecision::default();
    };

    // A delete pushed by a peer must not bounce back.
    if del_opts.replication_request {
        return ReplicateDecision::default();
    }

    if !del_opts.versioned {
        return ReplicateDecision::default();
    }

    let opts = ObjectOpts {
        name: dobj.object_name.clone(),
        user_tags: oi.user_tags.clone(),
        delete_marker: oi.delete_marker,
        version_id: dobj.version_id,
        op_type: ReplicationType::Delete,
        ..Default::default()
    };

    let tgt_arns = rcfg.filter_target_arns(&opts);
    let mut dsc = ReplicateDecision::default();
    if tgt_arns.is_empty() {
        return dsc;
    }

    let sync = false;
    for tgt_arn in tgt_arns {
        let mut opts = opts.clone();
        opts.target_arn = tgt_arn.clone();
        let replicate = rcfg.replicate(&opts);

        // When the local lookup failed the object may still carry
        // replication state that has to be resolved on the target.
        if gerr.is_some() {
            let valid_repl_status = matches!(
                oi.target_replication_status(&tgt_arn),
                ReplicationStatusType::Pending | ReplicationStatusType::Completed | ReplicationStatusType::Failed
            );

            if oi.delete_marker && (valid_repl_status || replicate) {
                dsc.set(ReplicateTargetDecision::new(tgt_arn, replicate, sync));
                continue;
            }

            if !oi.version_purge_status.is_empty() {
                let replicate = oi.version_purge_status.is_pending();
                dsc.set(ReplicateTargetDecision::new(tgt_arn, replicate, sync));
            }
            continue;
        }

        // Target online state is not considered when deciding deletes;
        // the target could be temporarily down and still must converge.
        let tgt = BucketTargetSys::get().get_remote_target_client(bucket, &tgt_arn).await;
        let tgt_dsc = match tgt {
            Some(tgt) => ReplicateTargetDecision::new(tgt_arn, replicate, tgt.replicate_sync),
            None => ReplicateTargetDecision::new(tgt_arn, false, false),
        };
        dsc.set(tgt_dsc);
    }

    dsc
}

// Standard headers never copied into replication user metadata.
static STANDARD_HEADERS: &[&str] = &[
    headers::CONTENT_TYPE,
    headers::CACHE_CONTROL,
    headers::CONTENT_ENCODING,
    headers::CONTENT_LANGUAGE,
    headers::CONTENT_DISPOSITION,
    headers::AMZ_STORAGE_CLASS,
    headers::AMZ_OBJECT_TAGGING,
    headers::AMZ_BUCKET_REPLICATION_STATUS,
    headers::AMZ_OBJECT_LOCK_MODE,
    headers::AMZ_OBJECT_LOCK_RETAIN_UNTIL_DATE,
    headers::AMZ_OBJECT_LOCK_LEGAL_HOLD,
    headers::AMZ_TAG_COUNT,
];

fn is_standard_header(k: &str) -> bool {
    STANDARD_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(k))
}

// Header prefixes the comparator considers for metadata-only drift.
static COMPARE_KEYS: &[&str] = &[
    "Expires",
    "Cache-Control",
    "Content-Language",
    "Content-Disposition",
    "X-Amz-Object-Lock-Mode",
    "X-Amz-Object-Lock-Retain-Until-Date",
    "X-Amz-Object-Lock-Legal-Hold",
    "X-Amz-Website-Redirect-Location",
    "X-Amz-Meta-",
];

fn compare_meta(meta: &HashMap<String, String>) -> HashMap<String, String> {
    meta.iter()
        .filter(|(k, _)| COMPARE_KEYS.iter().any(|prefix| strings_has_prefix_fold(k, prefix)))
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}

/// Compares a local version against the target's copy and decides how
/// much needs to move.
pub fn get_replication_action(oi1: &ObjectInfo, oi2: &RemoteObjectInfo, op_type: ReplicationType) -> ReplicationAction {
    // For existing-object replication of null versions, a strictly newer
    // local copy than the remote means the remote was written later by
    // someone else; leave it alone.
    if op_type == ReplicationType::ExistingObject && oi1.mod_time > oi2.last_modified && oi1.version_id.is_none() {
        return ReplicationAction::None;
    }

    let size = oi1.get_actual_size().unwrap_or_default();

    let oi1_etag = oi1.etag.as_deref().map(trim_etag);
    let oi2_etag = oi2.etag.as_deref().map(trim_etag);

    let oi1_vid = oi1.version_id.filter(|v| !v.is_nil()).map(|v| v.to_string());

    if oi1_etag != oi2_etag
        || oi1_vid != oi2.version_id
        || size != oi2.size
        || oi1.delete_marker != oi2.delete_marker
        || oi1.mod_time != oi2.last_modified
    {
        return ReplicationAction::All;
    }

    if oi1.content_type != oi2.content_type {
        return ReplicationAction::Metadata;
    }

    if let Some(content_encoding) = &oi1.content_encoding {
        let remote_enc = oi2
            .metadata
            .get(headers::CONTENT_ENCODING)
            .or_else(|| oi2.metadata.get(&headers::CONTENT_ENCODING.to_lowercase()));
        match remote_enc {
            Some(enc) if enc == content_encoding => {}
            // Absent on both sides compares equal; absent only remotely
            // is metadata drift.
            _ => return ReplicationAction::Metadata,
        }
    }

    let oi1_tags = decode_tags_to_map(&oi1.user_tags);
    let oi2_tags = decode_tags_to_map(&oi2.user_tags);
    if (oi2.tag_count > 0 && oi1_tags != oi2_tags) || oi2.tag_count != oi1_tags.len() as i32 {
        return ReplicationAction::Metadata;
    }

    if compare_meta(&oi1.user_defined) != compare_meta(&oi2.metadata) {
        return ReplicationAction::Metadata;
    }

    ReplicationAction::None
}

/// Builds the target-side PUT options from the local version: metadata
/// whitelist, tags plus tagging timestamp, object-lock timestamps and
/// source identity. The bool is whether multipart replication is needed.
pub fn put_replication_opts(sc: &str, object_info: &ObjectInfo) -> Result<(PutObjectOptions, bool)> {
    let mut meta = HashMap::new();
    for (k, v) in object_info.user_defined.iter() {
        if strings_has_prefix_fold(k, garnetfs_utils::http::RESERVED_METADATA_PREFIX) {
            continue;
        }
        if is_standard_header(k) {
            continue;
        }
        meta.insert(k.clone(), v.clone());
    }

    let storage_class = if sc.is_empty() {
        object_info.storage_class.clone().unwrap_or_default()
    } else {
        sc.to_string()
    };

    let mut put_opts = PutObjectOptions {
        user_metadata: meta,
        content_type: object_info.content_type.clone().unwrap_or_default(),
        content_encoding: object_info.content_encoding.clone().unwrap_or_default(),
        storage_class,
        internal: crate::bucket::target_sys::AdvancedPutOptions {
            source_version_id: object_info.version_id.filter(|v| !v.is_nil()).map(|v| v.to_string()).unwrap_or_default(),
            source_etag: object_info.etag.clone().unwrap_or_default(),
            source_mtime: object_info.mod_time,
            replication_status: ReplicationStatusType::Replica,
            // Always set so the peer can tell replication from a user PUT.
            replication_request: true,
            ..Default::default()
        },
        ..Default::default()
    };

    if !object_info.user_tags.is_empty() {
        let tags = decode_tags_to_map(&object_info.user_tags);
        if !tags.is_empty() {
            put_opts.user_tags = tags;
            put_opts.internal.tagging_timestamp = match object_info
                .user_defined
                .get(&format!("{RESERVED_METADATA_PREFIX_LOWER}{TAGGING_TIMESTAMP}"))
            {
                Some(ts) => Some(OffsetDateTime::parse(ts, &Rfc3339).map_err(Error::other)?),
                None => object_info.mod_time,
            };
        }
    }

    let lk = &object_info.user_defined;
    if let Some(lang) = lk.get(headers::CONTENT_LANGUAGE) {
        put_opts.content_language = lang.clone();
    }
    if let Some(cd) = lk.get(headers::CONTENT_DISPOSITION) {
        put_opts.content_disposition = cd.clone();
    }
    if let Some(cc) = lk.get(headers::CACHE_CONTROL) {
        put_opts.cache_control = cc.clone();
    }
    if let Some(loc) = lk.get(headers::AMZ_WEBSITE_REDIRECT_LOCATION) {
        put_opts.website_redirect_location = loc.clone();
    }
    if lk.contains_key(headers::AMZ_OBJECT_LOCK_RETAIN_UNTIL_DATE) {
        put_opts.internal.retention_timestamp = match lk.get(&format!(
            "{RESERVED_METADATA_PREFIX_LOWER}{}",
            garnetfs_filemeta::OBJECT_LOCK_RETENTION_TIMESTAMP
        )) {
            Some(ts) => OffsetDateTime::parse(ts, &Rfc3339).ok(),
            None => object_info.mod_time,
        };
    }
    if lk.contains_key(headers::AMZ_OBJECT_LOCK_LEGAL_HOLD) {
        put_opts.internal.legalhold_timestamp = match lk.get(&format!(
            "{RESERVED_METADATA_PREFIX_LOWER}{}",
            garnetfs_filemeta::OBJECT_LOCK_LEGAL_HOLD_TIMESTAMP
        )) {
            Some(ts) => OffsetDateTime::parse(ts, &Rfc3339).ok(),
            None => object_info.mod_time,
        };
    }

    Ok((put_opts, object_info.is_multipart()))
}

fn not_tracked_event(bucket: &str, object: ObjectInfo) {
    send_event(EventArgs {
        event_name: EventName::ObjectReplicationNotTracked.as_ref().to_string(),
        bucket_name: bucket.to_string(),
        object,
        user_agent: "Internal: [Replication]".to_string(),
        host: global_local_node_name(),
    });
}

/// Replicates one object version to every target its decision names and
/// writes the aggregated status back as object metadata.
pub async fn replicate_object<S: StorageAPI>(roi: ReplicateObjectInfo, storage: Arc<S>) {
    let bucket = roi.bucket.clone();
    let object = roi.name.clone();

    let cfg = match get_replication_config(&bucket).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("no replication config for bucket: {}", bucket);
            not_tracked_event(&bucket, roi.to_object_info());
            return;
        }
        Err(err) => {
            error!("failed to load replication config for bucket {}: {}", bucket, err);
            not_tracked_event(&bucket, roi.to_object_info());
            return;
        }
    };

    // Replication uses its own lock keyspace so it never contends with
    // live reads of the same object.
    let ns_lock = match storage.new_ns_lock(&bucket, &replicate_lock_key(&object)).await {
        Ok(lock) => lock,
        Err(err) => {
            warn!("failed to create replication lock for {}/{}: {}", bucket, object, err);
            not_tracked_event(&bucket, roi.to_object_info());
            return;
        }
    };
    let _lock_guard = match ns_lock.get_write_lock(crate::set_disk::get_lock_acquire_timeout()).await {
        Ok(guard) => guard,
        Err(err) => {
            warn!("failed to acquire replication lock for {}/{}: {}", bucket, object, err);
            not_tracked_event(&bucket, roi.to_object_info());
            return;
        }
    };

    let tgt_arns = cfg.filter_target_arns(&ObjectOpts {
        name: object.clone(),
        user_tags: roi.user_tags.clone(),
        ssec: roi.ssec,
        target_arn: roi.target_arn.clone(),
        ..Default::default()
    });

    let mut join_set = JoinSet::new();
    for arn in tgt_arns {
        let Some(tgt_client) = BucketTargetSys::get().get_remote_target_client(&bucket, &arn).await else {
            warn!("failed to get target client for bucket:{} arn:{}", bucket, arn);
            not_tracked_event(&bucket, roi.to_object_info());
            continue;
        };

        let roi_clone = roi.clone();
        let storage_clone = storage.clone();
        join_set.spawn(async move { replicate_to_target(&roi_clone, storage_clone, tgt_client).await });
    }

    let mut rinfos = ReplicatedInfos {
        replication_timestamp: Some(OffsetDateTime::now_utc()),
        targets: Vec::with_capacity(join_set.len()),
    };

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(tgt_info) => rinfos.targets.push(tgt_info),
            Err(err) => {
                error!("replication task for {}/{} panicked: {}", bucket, object, err);
                not_tracked_event(&bucket, roi.to_object_info());
            }
        }
    }

    let replication_status = rinfos.replication_status();
    let new_internal = rinfos.replication_status_internal();
    let mut object_info = roi.to_object_info();

    if roi.replication_status_internal != new_internal || rinfos.replication_resynced() {
        let mut eval_metadata = HashMap::new();
        if let Some(internal) = &new_internal {
            eval_metadata.insert(format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_STATUS}"), internal.clone());
        }
        eval_metadata.insert(
            format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_TIMESTAMP}"),
            OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        );
        eval_metadata.insert(AMZ_BUCKET_REPLICATION_STATUS.to_string(), replication_status.as_str().to_string());

        for rinfo in &rinfos.targets {
            if !rinfo.resync_timestamp.is_empty() {
                eval_metadata.insert(target_reset_header(&rinfo.arn), rinfo.resync_timestamp.clone());
            }
        }

        if !roi.user_tags.is_empty() {
            eval_metadata.insert(AMZ_OBJECT_TAGGING.to_string(), roi.user_tags.clone());
        }

        let popts = ObjectOptions {
            version_id: roi.version_id.map(|v| v.to_string()),
            eval_metadata: Some(eval_metadata),
            // The replication write lock is already held; a second
            // acquisition of the object lock is skipped on purpose and
            // only replication-status fields are patched.
            no_lock: true,
            ..Default::default()
        };

        match storage.put_object_metadata(&bucket, &object, &popts).await {
            Ok(updated) => object_info = updated,
            Err(err) => {
                error!("failed to persist replication status for {}/{}: {}", bucket, object, err);
            }
        }

        if let Some(stats) = global_replication_stats() {
            for rinfo in &rinfos.targets {
                if rinfo.replication_status != rinfo.prev_replication_status {
                    stats
                        .update(&bucket, rinfo, rinfo.replication_status.clone(), rinfo.prev_replication_status.clone())
                        .await;
                }
            }
        }
    }

    let event_name = if replication_status == ReplicationStatusType::Completed {
        EventName::ObjectReplicationComplete
    } else {
        EventName::ObjectReplicationFailed
    };
    send_event(EventArgs {
        event_name: event_name.as_ref().to_string(),
        bucket_name: bucket.clone(),
        object: object_info,
        user_agent: "Internal: [Replication]".to_string(),
        host: global_local_node_name(),
    });

    // One bounded retry through the MRF queue.
    if replication_status != ReplicationStatusType::Completed && roi.retry_count < 1 {
        let mut retry = roi.clone();
        retry.op_type = ReplicationType::Heal;
        retry.event_type = REPLICATE_MRF.to_string();
        retry.replication_status_internal = new_internal;
        retry.retry_count += 1;
        replication_pool::requeue_on_mrf(retry).await;
    }
}

/// Pushes one version to one target; never fails the caller, the outcome
/// is carried in the returned target info.
async fn replicate_to_target<S: StorageAPI>(
    roi: &ReplicateObjectInfo,
    storage: Arc<S>,
    tgt_client: Arc<TargetClient>,
) -> ReplicatedTargetInfo {
    let start_time = OffsetDateTime::now_utc();
    let bucket = roi.bucket.clone();
    let object = roi.name.clone();

    let mut rinfo = ReplicatedTargetInfo {
        arn: tgt_client.arn.clone(),
        size: roi.actual_size,
        replication_action: ReplicationAction::All,
        op_type: roi.op_type,
        replication_status: ReplicationStatusType::Failed,
        prev_replication_status: roi.target_replication_status(&tgt_client.arn),
        endpoint: tgt_client.endpoint.clone(),
        secure: tgt_client.secure,
        ..Default::default()
    };

    // Already completed and not part of a fresh resync pass: no-op.
    if rinfo.prev_replication_status == ReplicationStatusType::Completed
        && !roi.existing_obj_resync.is_empty()
        && !roi.existing_obj_resync.must_resync_target(&tgt_client.arn)
    {
        rinfo.replication_status = ReplicationStatusType::Completed;
        rinfo.replication_resynced = true;
        return rinfo;
    }

    if BucketTargetSys::get().is_offline(&tgt_client.to_url()).await {
        warn!("replication target is offline: {}", tgt_client.to_url());
        rinfo.error = Some(Error::RemoteTargetOffline(tgt_client.to_url()).to_string());
        not_tracked_event(&bucket, roi.to_object_info());
        return rinfo;
    }

    let versioned = BucketVersioningSys::prefix_enabled(&bucket, &object).await;
    let version_suspended = BucketVersioningSys::prefix_suspended(&bucket, &object).await;

    let mut gr = match storage
        .get_object_reader(
            &bucket,
            &object,
            None,
            http::HeaderMap::new(),
            &ObjectOptions {
                version_id: roi.version_id.map(|v| v.to_string()),
                versioned,
                version_suspended,
                replication_request: true,
                no_lock: true,
                ..Default::default()
            },
        )
        .await
    {
        Ok(gr) => gr,
        Err(err) => {
            if !is_err_object_not_found(&err) && !is_err_version_not_found(&err) {
                warn!("failed to read {}/{} for replication: {}", bucket, object, err);
                not_tracked_event(&bucket, roi.to_object_info());
            }
            rinfo.error = Some(err.to_string());
            return rinfo;
        }
    };

    let object_info = gr.object_info.clone();
    rinfo.prev_replication_status = object_info.target_replication_status(&tgt_client.arn);

    let size = match object_info.get_actual_size() {
        Ok(size) => size,
        Err(err) => {
            warn!("failed to resolve size of {}/{}: {}", bucket, object, err);
            not_tracked_event(&bucket, object_info);
            rinfo.error = Some(err.to_string());
            return rinfo;
        }
    };

    if tgt_client.bucket.is_empty() {
        rinfo.error = Some("target bucket is empty".to_string());
        not_tracked_event(&bucket, object_info);
        return rinfo;
    }

    let mut replication_action = ReplicationAction::All;
    match tgt_client
        .api
        .head_object(
            &tgt_client.bucket,
            &object,
            &StatObjectOptions {
                version_id: roi.version_id.map(|v| v.to_string()).unwrap_or_default(),
                ..Default::default()
            },
        )
        .await
    {
        Ok(remote) => {
            replication_action = get_replication_action(&object_info, &remote, roi.op_type);
            if replication_action == ReplicationAction::None {
                if roi.op_type == ReplicationType::ExistingObject
                    && object_info.mod_time > remote.last_modified
                    && object_info.version_id.is_none()
                {
                    // The remote null version is newer; leave it alone.
                    warn!(
                        "not replicating {}/{}: newer null version exists on {}",
                        bucket,
                        object,
                        tgt_client.to_url()
                    );
                    not_tracked_event(&bucket, object_info.clone());
                    return rinfo;
                }

                rinfo.replication_status = ReplicationStatusType::Completed;
                rinfo.replication_resynced = true;
                rinfo.replication_action = replication_action;
                rinfo.size = size;
                if roi.op_type == ReplicationType::ExistingObject && !tgt_client.reset_id.is_empty() {
                    rinfo.resync_timestamp = format!(
                        "{};{}",
                        OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
                        tgt_client.reset_id
                    );
                }
                rinfo.duration = (OffsetDateTime::now_utc() - start_time).unsigned_abs();
                return rinfo;
            }
        }
        Err(err) => {
            if !is_err_object_not_found(&err) && !is_err_version_not_found(&err) {
                rinfo.error = Some(err.to_string());
                warn!("replication stat failed for {}/{} on {}: {}", bucket, object, tgt_client.arn, err);
                rinfo.duration = (OffsetDateTime::now_utc() - start_time).unsigned_abs();
                return rinfo;
            }
            // Missing on the target: full upload.
        }
    }

    rinfo.size = size;
    rinfo.replication_action = replication_action;

    let (put_opts, is_multipart) = match put_replication_opts(&tgt_client.storage_class, &object_info) {
        Ok(v) => v,
        Err(err) => {
            warn!("failed to build replication options for {}/{}: {}", bucket, object, err);
            not_tracked_event(&bucket, object_info);
            rinfo.error = Some(err.to_string());
            return rinfo;
        }
    };

    let result: Result<()> = if replication_action == ReplicationAction::Metadata {
        tgt_client
            .api
            .copy_object(
                &tgt_client.bucket,
                &object,
                roi.version_id.map(|v| v.to_string()),
                &CopyObjectOptions {
                    user_metadata: put_opts.user_metadata.clone(),
                    user_tags: put_opts.user_tags.clone(),
                    internal: put_opts.internal.clone(),
                },
            )
            .await
    } else if is_multipart {
        let dst_bucket = tgt_client.bucket.clone();
        replicate_object_with_multipart(&tgt_client, &dst_bucket, &object, &mut *gr.stream, &object_info, put_opts).await
    } else {
        match gr.read_all().await {
            Ok(body) => {
                // Stream through the bandwidth monitor so operators see
                // per-target replication throughput.
                let monitored =
                    crate::bucket::bandwidth::MonitoredReader::new(std::io::Cursor::new(body), &tgt_client.arn);
                tgt_client
                    .api
                    .put_object(&tgt_client.bucket, &object, size, Box::new(monitored), &put_opts)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    };

    match result {
        Ok(()) => {
            rinfo.replication_status = ReplicationStatusType::Completed;
            if roi.op_type == ReplicationType::ExistingObject && !tgt_client.reset_id.is_empty() {
                rinfo.resync_timestamp = format!(
                    "{};{}",
                    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
                    tgt_client.reset_id
                );
                rinfo.replication_resynced = true;
            }
        }
        Err(err) => {
            rinfo.replication_status = ReplicationStatusType::Failed;
            rinfo.error = Some(err.to_string());
            warn!(
                "replication upload failed src={}/{} dst_bucket={} arn={} err={}",
                bucket, object, tgt_client.bucket, tgt_client.arn, err
            );
        }
    }

    rinfo.duration = (OffsetDateTime::now_utc() - start_time).unsigned_abs();
    rinfo
}

/// Multipart replication: the stored parts are pushed one by one with
/// their original actual sizes so the target reproduces the same part
/// geometry. A failed upload aborts the remote upload (retried, so no
/// storage leaks on the target).
async fn replicate_object_with_multipart(
    tgt_client: &Arc<TargetClient>,
    bucket: &str,
    object: &str,
    reader: &mut (dyn tokio::io::AsyncRead + Send + Sync + Unpin),
    object_info: &ObjectInfo,
    opts: PutObjectOptions,
) -> Result<()> {
    let upload_id = tgt_client.api.create_multipart_upload(bucket, object, &opts).await?;

    let mut uploaded_parts = Vec::with_capacity(object_info.parts.len());

    let upload_result: Result<()> = async {
        for part_info in object_info.parts.iter() {
            let mut chunk = vec![0u8; part_info.actual_size.max(0) as usize];
            reader.read_exact(&mut chunk).await.map_err(Error::from)?;

            let part = tgt_client
                .api
                .put_object_part(
                    bucket,
                    object,
                    &upload_id,
                    part_info.number as i32,
                    part_info.actual_size,
                    bytes::Bytes::from(chunk),
                    &PutObjectPartOptions::default(),
                )
                .await?;

            uploaded_parts.push(CompletedPart {
                part_number: part_info.number as i32,
                etag: part.etag,
            });
        }

        tgt_client
            .api
            .complete_multipart_upload(bucket, object, &upload_id, uploaded_parts.clone(), &opts)
            .await
    }
    .await;

    if let Err(err) = upload_result {
        // Keep the remote side clean; a leaked upload holds storage until
        // its sweeper runs.
        for attempt in 0..3 {
            match tgt_client.api.abort_multipart_upload(bucket, object, &upload_id).await {
                Ok(()) => break,
                Err(abort_err) => {
                    warn!(
                        "abort of remote upload {} failed (attempt {}): {}",
                        upload_id,
                        attempt + 1,
                        abort_err
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        return Err(err);
    }

    Ok(())
}

/// Replicates a delete (hard version delete or delete marker) to every
/// target the persisted decision names, then updates the delete-marker
/// metadata on disk through the object layer.
pub async fn replicate_delete<S: StorageAPI>(dobj: DeletedObjectReplicationInfo, storage: Arc<S>) {
    let bucket = dobj.bucket.clone();
    let version_id = dobj.delete_object.delete_marker_version_id.or(dobj.delete_object.version_id);

    let not_tracked_object = |dobj: &DeletedObjectReplicationInfo| ObjectInfo {
        bucket: bucket.clone(),
        name: dobj.delete_object.object_name.clone(),
        version_id,
        delete_marker: dobj.delete_object.delete_marker,
        ..Default::default()
    };

    match get_replication_config(&bucket).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!("no replication config for bucket: {}", bucket);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            return;
        }
        Err(err) => {
            error!("failed to load replication config for bucket {}: {}", bucket, err);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            return;
        }
    }

    // The decision persisted on the delete record drives the fan-out so a
    // restart can resume exactly where it left off.
    let dsc = match parse_replicate_decision(
        &dobj
            .delete_object
            .replication_state
            .as_ref()
            .map(|v| v.replicate_decision_str.clone())
            .unwrap_or_default(),
    ) {
        Ok(dsc) => dsc,
        Err(err) => {
            warn!("failed to parse replicate decision for bucket {}: {}", bucket, err);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            return;
        }
    };

    let ns_lock = match storage
        .new_ns_lock(&bucket, &replicate_lock_key(&dobj.delete_object.object_name))
        .await
    {
        Ok(lock) => lock,
        Err(err) => {
            warn!("failed to create replication lock: {}", err);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            return;
        }
    };
    let _lock_guard = match ns_lock.get_write_lock(crate::set_disk::get_lock_acquire_timeout()).await {
        Ok(guard) => guard,
        Err(err) => {
            warn!("failed to acquire replication lock: {}", err);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            return;
        }
    };

    let mut join_set = JoinSet::new();
    for tgt_entry in dsc.targets_map.values() {
        if !tgt_entry.replicate {
            continue;
        }

        // A non-empty TargetArn means one specific target is being
        // resynced.
        if !dobj.target_arn.is_empty() && dobj.target_arn != tgt_entry.arn {
            continue;
        }

        let Some(tgt_client) = BucketTargetSys::get().get_remote_target_client(&bucket, &tgt_entry.arn).await else {
            warn!("failed to get target client for bucket:{} arn:{}", bucket, tgt_entry.arn);
            not_tracked_event(&bucket, not_tracked_object(&dobj));
            continue;
        };

        let dobj_clone = dobj.clone();
        join_set.spawn(async move { replicate_delete_to_target(&dobj_clone, tgt_client).await });
    }

    let mut rinfos = ReplicatedInfos {
        replication_timestamp: Some(OffsetDateTime::now_utc()),
        targets: Vec::with_capacity(dsc.targets_map.len()),
    };

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(tgt_info) => rinfos.targets.push(tgt_info),
            Err(err) => {
                error!("delete replication task failed: {}", err);
                not_tracked_event(&bucket, not_tracked_object(&dobj));
            }
        }
    }

    let (replication_status, prev_status) = if dobj.delete_object.version_id.is_none() {
        (
            rinfos.replication_status(),
            dobj.delete_object
                .replication_state
                .as_ref()
                .map(|v| v.composite_replication_status())
                .unwrap_or_default(),
        )
    } else {
        (
            ReplicationStatusType::from(rinfos.version_purge_status()),
            ReplicationStatusType::from(
                dobj.delete_object
                    .replication_state
                    .as_ref()
                    .map(|v| v.composite_version_purge_status())
                    .unwrap_or_default(),
            ),
        )
    };

    if let Some(stats) = global_replication_stats() {
        for tgt in rinfos.targets.iter() {
            if tgt.replication_status != tgt.prev_replication_status {
                stats
                    .update(&bucket, tgt, tgt.replication_status.clone(), tgt.prev_replication_status.clone())
                    .await;
            }
        }
    }

    let mut drs = garnetfs_filemeta::get_replication_state(
        &rinfos,
        &dobj.delete_object.replication_state.clone().unwrap_or_default(),
    );
    if replication_status != prev_status {
        drs.replication_timestamp = Some(OffsetDateTime::now_utc());
    }

    let event_name = if replication_status == ReplicationStatusType::Completed {
        EventName::ObjectReplicationComplete
    } else {
        EventName::ObjectReplicationFailed
    };

    match storage
        .delete_object(
            &bucket,
            &dobj.delete_object.object_name,
            ObjectOptions {
                version_id: version_id.map(|v| v.to_string()),
                mod_time: dobj.delete_object.delete_marker_mtime,
                delete_replication: Some(drs),
                versioned: BucketVersioningSys::prefix_enabled(&bucket, &dobj.delete_object.object_name).await,
                version_suspended: BucketVersioningSys::prefix_suspended(&bucket, &dobj.delete_object.object_name).await,
                ..Default::default()
            },
        )
        .await
    {
        Ok(object) => {
            send_event(EventArgs {
                event_name: event_name.as_ref().to_string(),
                bucket_name: bucket.clone(),
                object,
                user_agent: "Internal: [Replication]".to_string(),
                host: global_local_node_name(),
            });
        }
        Err(err) => {
            error!(
                "failed to update delete replication state for {}/{}: {}",
                bucket, dobj.delete_object.object_name, err
            );
            send_event(EventArgs {
                event_name: event_name.as_ref().to_string(),
                bucket_name: bucket.clone(),
                object: not_tracked_object(&dobj),
                user_agent: "Internal: [Replication]".to_string(),
                host: global_local_node_name(),
            });
        }
    }
}

async fn replicate_delete_to_target(dobj: &DeletedObjectReplicationInfo, tgt_client: Arc<TargetClient>) -> ReplicatedTargetInfo {
    let version_id = dobj.delete_object.delete_marker_version_id.or(dobj.delete_object.version_id);

    let mut rinfo = dobj
        .delete_object
        .replication_state
        .clone()
        .unwrap_or_default()
        .target_state(&tgt_client.arn);
    rinfo.op_type = dobj.op_type;
    rinfo.endpoint = tgt_client.endpoint.clone();
    rinfo.secure = tgt_client.secure;

    // Delete marker already replicated and this is not a resync pass.
    if dobj.delete_object.version_id.is_none()
        && rinfo.prev_replication_status == ReplicationStatusType::Completed
        && dobj.op_type != ReplicationType::ExistingObject
    {
        rinfo.replication_status = rinfo.prev_replication_status.clone();
        return rinfo;
    }

    // Version already purged on this target.
    if dobj.delete_object.version_id.is_some() && rinfo.version_purge_status == VersionPurgeStatusType::Complete {
        return rinfo;
    }

    if BucketTargetSys::get().is_offline(&tgt_client.to_url()).await {
        if dobj.delete_object.version_id.is_none() {
            rinfo.replication_status = ReplicationStatusType::Failed;
        } else {
            rinfo.version_purge_status = VersionPurgeStatusType::Failed;
        }
        rinfo.error = Some(Error::RemoteTargetOffline(tgt_client.to_url()).to_string());
        return rinfo;
    }

    let version_id_str = version_id.filter(|v| !v.is_nil()).map(|v| v.to_string());

    match tgt_client
        .api
        .remove_object(
            &tgt_client.bucket,
            &dobj.delete_object.object_name,
            version_id_str,
            &RemoveObjectOptions {
                force_delete: false,
                replication_delete_marker: dobj.delete_object.delete_marker_version_id.is_some(),
                replication_mtime: dobj.delete_object.delete_marker_mtime,
                replication_status: ReplicationStatusType::Replica,
                replication_request: true,
            },
        )
        .await
    {
        Ok(()) => {
            if dobj.delete_object.version_id.is_none() {
                rinfo.replication_status = ReplicationStatusType::Completed;
            } else {
                rinfo.version_purge_status = VersionPurgeStatusType::Complete;
            }
        }
        Err(err) => {
            rinfo.error = Some(err.to_string());
            if dobj.delete_object.version_id.is_none() {
                rinfo.replication_status = ReplicationStatusType::Failed;
            } else {
                rinfo.version_purge_status = VersionPurgeStatusType::Failed;
            }
        }
    }

    if rinfo.replication_status == ReplicationStatusType::Completed
        && !tgt_client.reset_id.is_empty()
        && dobj.op_type == ReplicationType::ExistingObject
    {
        rinfo.resync_timestamp = format!(
            "{};{}",
            OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            tgt_client.reset_id
        );
    }

    rinfo
}

/// Force deletes (bucket purge) propagate to every configured target
/// without any per-version state tracking.
pub async fn replicate_force_delete_to_targets<S: StorageAPI>(dobj: &DeletedObjectReplicationInfo, storage: Arc<S>) {
    let bucket = &dobj.bucket;
    let object_name = &dobj.delete_object.object_name;

    let Ok(Some(rcfg)) = get_replication_config(bucket).await else {
        warn!("force-delete replication: no config for bucket {}", bucket);
        return;
    };

    let Ok(ns_lock) = storage.new_ns_lock(bucket, &replicate_lock_key(object_name)).await else {
        return;
    };
    let Ok(_guard) = ns_lock.get_write_lock(crate::set_disk::get_lock_acquire_timeout()).await else {
        return;
    };

    let tgt_arns = if !dobj.target_arn.is_empty() {
        vec![dobj.target_arn.clone()]
    } else {
        rcfg.filter_target_arns(&ObjectOpts {
            name: object_name.clone(),
            ..Default::default()
        })
    };

    let mut join_set = JoinSet::new();
    for arn in tgt_arns {
        let Some(tgt_client) = BucketTargetSys::get().get_remote_target_client(bucket, &arn).await else {
            continue;
        };
        let object_name = object_name.clone();
        let bucket = bucket.clone();
        join_set.spawn(async move {
            if BucketTargetSys::get().is_offline(&tgt_client.to_url()).await {
                error!("force-delete replication: target offline bucket:{} arn:{}", bucket, tgt_client.arn);
                return;
            }
            if let Err(err) = tgt_client
                .api
                .remove_object(
                    &tgt_client.bucket,
                    &object_name,
                    None,
                    &RemoveObjectOptions {
                        force_delete: true,
                        replication_status: ReplicationStatusType::Replica,
                        replication_request: true,
                        ..Default::default()
                    },
                )
                .await
            {
                error!(
                    "force-delete replication failed bucket:{} object:{} arn:{} err:{}",
                    bucket, object_name, tgt_client.arn, err
                );
            }
        });
    }

    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            error!("force-delete replication task panicked: {}", err);
        }
    }
}

/// Builds the per-target statuses carried on a heal/resync candidate into
/// maps the workers can consume directly.
pub fn heal_status_maps(
    oi: &ObjectInfo,
) -> (HashMap<String, ReplicationStatusType>, HashMap<String, VersionPurgeStatusType>) {
    (
        replication_statuses_map(oi.replication_status_internal.as_deref().unwrap_or_default()),
        version_purge_statuses_map(oi.version_purge_status_internal.as_deref().unwrap_or_default()),
    )
}

/// Normalizes legacy single-target status strings onto the role ARN so
/// older metadata participates in per-target bookkeeping.
pub fn normalize_legacy_status(oi: &mut ObjectInfo, rcfg: &ReplicationConfiguration) {
    if rcfg.role.is_empty() {
        return;
    }
    if !oi.replication_status.is_empty() {
        oi.replication_status_internal = Some(format!("{}={};", rcfg.role, oi.replication_status.as_str()));
    }
    if !oi.version_purge_status.is_empty() {
        oi.version_purge_status_internal = Some(format!("{}={};", rcfg.role, oi.version_purge_status.as_str()));
    }
    let legacy_key = format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_RESET}");
    let to_replace: Vec<(String, String)> = oi
        .user_defined
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(&legacy_key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in to_replace {
        oi.user_defined.remove(&k);
        oi.user_defined.insert(target_reset_header(&rcfg.role), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(etag: &str, size: i64, ts: i64) -> ObjectInfo {
        ObjectInfo {
            etag: Some(etag.to_string()),
            size,
            actual_size: size,
            mod_time: Some(OffsetDateTime::from_unix_timestamp(ts).unwrap()),
            ..Default::default()
        }
    }

    fn remote(etag: &str, size: i64, ts: i64) -> RemoteObjectInfo {
        RemoteObjectInfo {
            etag: Some(etag.to_string()),
            size,
            last_modified: Some(OffsetDateTime::from_unix_timestamp(ts).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_action_self_comparison_is_none() {
        let oi = local("abc", 10, 100);
        let roi = remote("abc", 10, 100);
        for op in [ReplicationType::Object, ReplicationType::Heal, ReplicationType::ExistingObject] {
            assert_eq!(get_replication_action(&oi, &roi, op), ReplicationAction::None);
        }
    }

    #[test]
    fn test_action_content_difference_is_all() {
        let oi = local("abc", 10, 100);
        assert_eq!(
            get_replication_action(&oi, &remote("def", 10, 100), ReplicationType::Object),
            ReplicationAction::All
        );
        assert_eq!(
            get_replication_action(&oi, &remote("abc", 11, 100), ReplicationType::Object),
            ReplicationAction::All
        );
        assert_eq!(
            get_replication_action(&oi, &remote("abc", 10, 101), ReplicationType::Object),
            ReplicationAction::All
        );
    }

    #[test]
    fn test_action_tags_differ_is_metadata() {
        let mut oi = local("abc", 10, 100);
        oi.user_tags = "k=v".to_string();
        let mut roi = remote("abc", 10, 100);
        roi.user_tags = "k=other".to_string();
        roi.tag_count = 1;
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::Metadata);
    }

    #[test]
    fn test_action_meta_whitelist() {
        let mut oi = local("abc", 10, 100);
        oi.user_defined
            .insert("X-Amz-Meta-Team".to_string(), "storage".to_string());
        let roi = remote("abc", 10, 100);
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::Metadata);

        // Non-whitelisted keys are ignored.
        let mut oi = local("abc", 10, 100);
        oi.user_defined.insert("x-internal-counter".to_string(), "7".to_string());
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::None);
    }

    #[test]
    fn test_action_existing_null_version_newer_local() {
        let oi = local("abc", 10, 200);
        let roi = remote("zzz", 99, 100);
        assert_eq!(
            get_replication_action(&oi, &roi, ReplicationType::ExistingObject),
            ReplicationAction::None
        );
        // Same shapes under Object replication still resolve to All.
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::All);
    }

    #[test]
    fn test_content_encoding_absent_both_sides_equal() {
        let mut oi = local("abc", 10, 100);
        oi.content_encoding = None;
        let roi = remote("abc", 10, 100);
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::None);

        oi.content_encoding = Some("gzip".to_string());
        assert_eq!(get_replication_action(&oi, &roi, ReplicationType::Object), ReplicationAction::Metadata);
    }

    #[test]
    fn test_put_replication_opts_filters_reserved() {
        let mut oi = local("abc", 10, 100);
        oi.user_defined
            .insert(format!("{RESERVED_METADATA_PREFIX_LOWER}replication-status"), "x".to_string());
        oi.user_defined.insert("x-amz-meta-app".to_string(), "demo".to_string());
        oi.user_defined
            .insert(headers::CONTENT_LANGUAGE.to_string(), "en".to_string());
        oi.user_tags = "k=v".to_string();

        let (opts, is_multipart) = put_replication_opts("", &oi).unwrap();
        assert!(!is_multipart);
        assert!(opts.user_metadata.contains_key("x-amz-meta-app"));
        assert!(!opts.user_metadata.keys().any(|k| k.starts_with(RESERVED_METADATA_PREFIX_LOWER)));
        assert_eq!(opts.content_language, "en");
        assert!(opts.internal.replication_request);
        assert_eq!(opts.internal.replication_status, ReplicationStatusType::Replica);
        assert_eq!(opts.user_tags.get("k").map(String::as_str), Some("v"));
        assert_eq!(opts.internal.tagging_timestamp, oi.mod_time);
    }

    #[test]
    fn test_multipart_flag_follows_etag_shape() {
        let mut oi = local("abc", 10, 100);
        oi.etag = Some("5d41402abc4b2a76b9719d911017c592-4".to_string());
        let (_, is_multipart) = put_replication_opts("", &oi).unwrap();
        assert!(is_multipart);
    }
}

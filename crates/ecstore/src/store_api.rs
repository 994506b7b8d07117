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

//! Object-layer contract: the option/info types every operation carries
//! and the traits the erasure set, the set group and the pool composition
//! all implement.

use crate::disk::{DiskInfo, DiskStore};
use crate::error::{Error, Result};
use bytes::Bytes;
use garnetfs_filemeta::{
    FileInfo, ObjectPartInfo, REPLICATION_RESET, REPLICATION_STATUS, ReplicateDecision, ReplicationState, ReplicationStatusType,
    VersionPurgeStatusType, replication_statuses_map, target_replication_status, version_purge_statuses_map,
};
use garnetfs_lock::NamespaceLock;
use garnetfs_utils::http::headers::AMZ_OBJECT_TAGGING;
use garnetfs_utils::http::{AMZ_BUCKET_REPLICATION_STATUS, RESERVED_METADATA_PREFIX_LOWER};
use garnetfs_utils::path::decode_dir_object;
use md5::{Digest as _, Md5};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const ERASURE_ALGORITHM: &str = "rs-vandermonde";

#[derive(Debug, Default, Clone)]
pub struct MakeBucketOptions {
    pub lock_enabled: bool,
    pub versioning_enabled: bool,
    /// Create buckets even if they are already created.
    pub force_create: bool,
    pub no_lock: bool,
}

#[derive(Debug, Default, Clone)]
pub struct DeleteBucketOptions {
    pub no_lock: bool,
    pub force: bool,
}

#[derive(Debug, Default, Clone)]
pub struct BucketOptions {
    pub deleted: bool,
    pub cached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BucketInfo {
    pub name: String,
    pub created: Option<OffsetDateTime>,
    pub versioning: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ObjectOptions {
    /// Use the maximum parity (N/2), used when saving system config files.
    pub max_parity: bool,
    pub mod_time: Option<OffsetDateTime>,
    pub part_number: Option<usize>,

    pub delete_prefix: bool,
    pub version_id: Option<String>,
    pub no_lock: bool,

    pub versioned: bool,
    pub version_suspended: bool,

    pub user_defined: HashMap<String, String>,
    pub preserve_etag: Option<String>,
    pub metadata_chg: bool,

    pub delete_replication: Option<ReplicationState>,
    /// Set when the request originated from a replication peer.
    pub replication_request: bool,
    pub delete_marker: bool,

    /// Metadata patch applied by put_object_metadata.
    pub eval_metadata: Option<HashMap<String, String>>,
}

impl ObjectOptions {
    /// Stamps the pending delete-replication state derived from a
    /// decision onto the options, so the delete marker written to disk
    /// carries enough to resume after a restart.
    pub fn set_delete_replication_state(&mut self, dsc: ReplicateDecision) {
        let mut rs = ReplicationState {
            replicate_decision_str: dsc.to_string(),
            ..Default::default()
        };
        if self.version_id.is_none() {
            rs.replication_status_internal = dsc.pending_status();
            rs.targets = replication_statuses_map(rs.replication_status_internal.as_deref().unwrap_or_default());
        } else {
            rs.version_purge_status_internal = dsc.pending_status();
            rs.purge_targets = version_purge_statuses_map(rs.version_purge_status_internal.as_deref().unwrap_or_default());
        }

        self.delete_replication = Some(rs)
    }

    pub fn set_replica_status(&mut self, status: ReplicationStatusType) {
        if let Some(rs) = self.delete_replication.as_mut() {
            rs.replica_status = status;
            rs.replica_timestamp = Some(OffsetDateTime::now_utc());
        } else {
            self.delete_replication = Some(ReplicationState {
                replica_status: status,
                replica_timestamp: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            });
        }
    }

    pub fn version_purge_status(&self) -> VersionPurgeStatusType {
        self.delete_replication
            .as_ref()
            .map(|v| v.composite_version_purge_status())
            .unwrap_or_default()
    }

    pub fn delete_marker_replication_status(&self) -> ReplicationStatusType {
        self.delete_replication
            .as_ref()
            .map(|v| v.composite_replication_status())
            .unwrap_or_default()
    }

    /// Replication state a fresh PUT carries, derived from the incoming
    /// internal status header when present.
    pub fn put_replication_state(&self) -> ReplicationState {
        let Some(rs) = self
            .user_defined
            .get(format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_STATUS}").as_str())
        else {
            return ReplicationState::default();
        };

        ReplicationState {
            replication_status_internal: Some(rs.to_string()),
            targets: replication_statuses_map(rs.as_str()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MultipartUploadResult {
    pub upload_id: String,
}

#[derive(Debug, Default, Clone)]
pub struct PartInfo {
    pub part_num: usize,
    pub last_mod: Option<OffsetDateTime>,
    pub size: usize,
    pub etag: Option<String>,
    pub actual_size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CompletePart {
    pub part_num: usize,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MultipartInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub initiated: Option<OffsetDateTime>,
    pub user_defined: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListMultipartsInfo {
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub max_uploads: usize,
    pub is_truncated: bool,
    pub uploads: Vec<MultipartInfo>,
    pub prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListPartsInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub part_number_marker: usize,
    pub next_part_number_marker: usize,
    pub max_parts: usize,
    pub is_truncated: bool,
    pub parts: Vec<PartInfo>,
    pub user_defined: HashMap<String, String>,
}

/// The resolved view of one object version as the object layer hands it
/// out and the replication engine consumes it.
#[derive(Debug, Default, Clone)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub storage_class: Option<String>,
    pub mod_time: Option<OffsetDateTime>,
    pub size: i64,
    /// Size of the payload the client uploaded, before transforms.
    pub actual_size: i64,
    pub is_dir: bool,
    pub user_defined: HashMap<String, String>,
    pub parity_blocks: usize,
    pub data_blocks: usize,
    pub version_id: Option<Uuid>,
    pub delete_marker: bool,
    pub user_tags: String,
    pub parts: Vec<ObjectPartInfo>,
    pub is_latest: bool,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expires: Option<OffsetDateTime>,
    pub num_versions: usize,
    pub successor_mod_time: Option<OffsetDateTime>,
    pub etag: Option<String>,
    pub inlined: bool,
    pub metadata_only: bool,
    pub replication_status_internal: Option<String>,
    pub replication_status: ReplicationStatusType,
    pub version_purge_status_internal: Option<String>,
    pub version_purge_status: VersionPurgeStatusType,
    pub replication_decision: String,
    pub checksum: Option<Bytes>,
}

impl ObjectInfo {
    pub fn from_file_info(fi: &FileInfo, bucket: &str, object: &str, versioned: bool) -> ObjectInfo {
        let name = decode_dir_object(object);

        let mut version_id = fi.version_id;
        if versioned && version_id.is_none() {
            version_id = Some(Uuid::nil());
        }

        let content_type = fi.metadata.get("content-type").cloned();
        let content_encoding = fi.metadata.get("content-encoding").cloned();
        let etag = fi.metadata.get("etag").cloned();
        let user_tags = fi.metadata.get(AMZ_OBJECT_TAGGING).cloned().unwrap_or_default();

        let replication_status_internal = fi
            .replication_state_internal
            .as_ref()
            .and_then(|v| v.replication_status_internal.clone());
        let version_purge_status_internal = fi
            .replication_state_internal
            .as_ref()
            .and_then(|v| v.version_purge_status_internal.clone());

        let mut replication_status = fi.replication_status();
        if replication_status.is_empty() {
            if let Some(status) = fi.metadata.get(AMZ_BUCKET_REPLICATION_STATUS) {
                if status == ReplicationStatusType::Replica.as_str() {
                    replication_status = ReplicationStatusType::Replica;
                }
            }
        }

        let actual_size = fi.get_actual_size().unwrap_or(fi.size);

        ObjectInfo {
            bucket: bucket.to_string(),
            name,
            is_dir: object.ends_with('/'),
            parity_blocks: fi.erasure.parity_blocks,
            data_blocks: fi.erasure.data_blocks,
            version_id,
            delete_marker: fi.deleted,
            mod_time: fi.mod_time,
            size: fi.size,
            actual_size,
            parts: fi.parts.clone(),
            is_latest: fi.is_latest,
            user_tags,
            content_type,
            content_encoding,
            num_versions: fi.num_versions,
            successor_mod_time: fi.successor_mod_time,
            etag,
            inlined: fi.inline_data(),
            user_defined: fi.metadata.clone(),
            checksum: fi.checksum.clone(),
            replication_status_internal,
            replication_status,
            version_purge_status_internal,
            version_purge_status: fi.version_purge_status(),
            ..Default::default()
        }
    }

    /// Multipart uploads carry a `-N` suffixed ETag, simple uploads a
    /// plain 32-hex digest.
    pub fn is_multipart(&self) -> bool {
        self.etag.as_ref().is_some_and(|v| v.len() != 32 && !v.is_empty())
    }

    pub fn get_actual_size(&self) -> Result<i64> {
        if self.actual_size > 0 {
            return Ok(self.actual_size);
        }
        if let Some(size_str) = self.user_defined.get(&format!("{RESERVED_METADATA_PREFIX_LOWER}actual-size")) {
            if !size_str.is_empty() {
                return size_str.parse::<i64>().map_err(Error::other);
            }
        }
        Ok(self.size)
    }

    pub fn target_replication_status(&self, arn: &str) -> ReplicationStatusType {
        target_replication_status(self.replication_status_internal.as_deref().unwrap_or_default(), arn)
    }

    pub fn replication_state(&self) -> ReplicationState {
        ReplicationState {
            replication_status_internal: self.replication_status_internal.clone(),
            version_purge_status_internal: self.version_purge_status_internal.clone(),
            replicate_decision_str: self.replication_decision.clone(),
            targets: replication_statuses_map(self.replication_status_internal.as_deref().unwrap_or_default()),
            purge_targets: version_purge_statuses_map(self.version_purge_status_internal.as_deref().unwrap_or_default()),
            reset_statuses_map: self
                .user_defined
                .iter()
                .filter_map(|(k, v)| {
                    let prefix = format!("{RESERVED_METADATA_PREFIX_LOWER}{REPLICATION_RESET}-");
                    k.strip_prefix(&prefix).map(|arn| (arn.to_string(), v.clone()))
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ObjectToDelete {
    pub object_name: String,
    pub version_id: Option<Uuid>,
    pub delete_marker_replication_status: Option<String>,
    pub version_purge_statuses: Option<String>,
    pub replicate_decision_str: Option<String>,
}

impl ObjectToDelete {
    pub fn replication_state(&self) -> ReplicationState {
        ReplicationState {
            replication_status_internal: self.delete_marker_replication_status.clone(),
            version_purge_status_internal: self.version_purge_statuses.clone(),
            replicate_decision_str: self.replicate_decision_str.clone().unwrap_or_default(),
            targets: replication_statuses_map(self.delete_marker_replication_status.as_deref().unwrap_or_default()),
            purge_targets: version_purge_statuses_map(self.version_purge_statuses.as_deref().unwrap_or_default()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DeletedObject {
    pub delete_marker: bool,
    pub delete_marker_version_id: Option<Uuid>,
    pub object_name: String,
    pub version_id: Option<Uuid>,
    /// MTime of the delete marker on the source, propagated to replicas.
    pub delete_marker_mtime: Option<OffsetDateTime>,
    pub replication_state: Option<ReplicationState>,
    pub found: bool,
    pub force_delete: bool,
}

impl DeletedObject {
    pub fn version_purge_status(&self) -> VersionPurgeStatusType {
        self.replication_state
            .as_ref()
            .map(|v| v.composite_version_purge_status())
            .unwrap_or_default()
    }

    pub fn delete_marker_replication_status(&self) -> ReplicationStatusType {
        self.replication_state
            .as_ref()
            .map(|v| v.composite_replication_status())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct ObjectInfoOrErr {
    pub item: Option<ObjectInfo>,
    pub err: Option<Error>,
}

#[derive(Clone, Default)]
pub struct WalkOptions {
    /// Skip entries up to and including this object name.
    pub marker: Option<String>,
    pub latest_only: bool,
    pub filter_prefix: Option<String>,
}

/// Byte range of a GET request, inclusive start, optional inclusive end.
#[derive(Debug, Clone, Default)]
pub struct HTTPRangeSpec {
    pub start: i64,
    pub end: i64,
    pub suffix: bool,
}

impl HTTPRangeSpec {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            suffix: false,
        }
    }

    pub fn get_offset_length(&self, total: i64) -> Result<(i64, i64)> {
        if self.suffix {
            let length = self.start.min(total);
            return Ok((total - length, length));
        }
        if self.start < 0 || self.start >= total {
            return Err(Error::InvalidArgument("range start out of bounds".to_string()));
        }
        let end = if self.end < 0 || self.end >= total { total - 1 } else { self.end };
        if end < self.start {
            return Err(Error::InvalidArgument("range end before start".to_string()));
        }
        Ok((self.start, end - self.start + 1))
    }
}

/// AsyncRead wrapper that folds the stream through MD5 so the ETag falls
/// out of the write path without a second pass.
pub struct EtagReader {
    inner: Box<dyn AsyncRead + Send + Sync + Unpin>,
    md5: Arc<Mutex<Md5>>,
}

impl EtagReader {
    pub fn new(inner: Box<dyn AsyncRead + Send + Sync + Unpin>) -> Self {
        Self {
            inner,
            md5: Arc::new(Mutex::new(Md5::new())),
        }
    }

    pub fn etag(&self) -> String {
        let hasher = self.md5.lock().expect("etag hasher lock poisoned");
        hex::encode(hasher.clone().finalize())
    }
}

impl AsyncRead for EtagReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let filled = buf.filled();
            if filled.len() > before {
                let mut hasher = self.md5.lock().expect("etag hasher lock poisoned");
                hasher.update(&filled[before..]);
            }
        }
        res
    }
}

/// Reader handed into put_object; owns the stream and size hints.
pub struct PutObjReader {
    pub stream: EtagReader,
    size: i64,
    actual_size: i64,
}

impl PutObjReader {
    pub fn new(stream: Box<dyn AsyncRead + Send + Sync + Unpin>, size: i64) -> Self {
        Self {
            stream: EtagReader::new(stream),
            size,
            actual_size: size,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len() as i64;
        Self::new(Box::new(std::io::Cursor::new(data)), size)
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn actual_size(&self) -> i64 {
        self.actual_size
    }

    pub fn etag(&self) -> String {
        self.stream.etag()
    }
}

impl std::fmt::Debug for PutObjReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutObjReader").field("size", &self.size).finish()
    }
}

/// Streaming GET response: decoded bytes plus the resolved object info.
pub struct GetObjectReader {
    pub stream: Box<dyn AsyncRead + Send + Sync + Unpin>,
    pub object_info: ObjectInfo,
}

impl GetObjectReader {
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.stream.read_to_end(&mut buf).await.map_err(Error::from)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for GetObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectReader").field("object_info", &self.object_info).finish()
    }
}

/// Aggregate drive capacity and health for one layer of the topology.
#[derive(Debug, Default, Clone)]
pub struct StorageInfo {
    pub disks: Vec<DiskInfo>,
    pub online_disks: usize,
    pub offline_disks: usize,
}

/// Plain data-path IO, implemented by every composition layer.
#[async_trait::async_trait]
pub trait ObjectIO: Send + Sync {
    async fn get_object_reader(
        &self,
        bucket: &str,
        object: &str,
        range: Option<HTTPRangeSpec>,
        h: http::HeaderMap,
        opts: &ObjectOptions,
    ) -> Result<GetObjectReader>;

    async fn put_object(&self, bucket: &str, object: &str, data: &mut PutObjReader, opts: &ObjectOptions) -> Result<ObjectInfo>;
}

/// The full object layer contract the frontend consumes.
#[async_trait::async_trait]
pub trait StorageAPI: ObjectIO + std::fmt::Debug + Send + Sync + 'static {
    async fn new_ns_lock(&self, bucket: &str, object: &str) -> Result<NamespaceLock>;

    async fn storage_info(&self) -> StorageInfo;
    async fn local_storage_info(&self) -> StorageInfo;

    async fn make_bucket(&self, bucket: &str, opts: &MakeBucketOptions) -> Result<()>;
    async fn get_bucket_info(&self, bucket: &str, opts: &BucketOptions) -> Result<BucketInfo>;
    async fn list_bucket(&self, opts: &BucketOptions) -> Result<Vec<BucketInfo>>;
    async fn delete_bucket(&self, bucket: &str, opts: &DeleteBucketOptions) -> Result<()>;

    async fn get_object_info(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo>;
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        src_info: &mut ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;
    async fn delete_object(&self, bucket: &str, object: &str, opts: ObjectOptions) -> Result<ObjectInfo>;
    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectToDelete>,
        opts: ObjectOptions,
    ) -> Result<(Vec<DeletedObject>, Vec<Option<Error>>)>;

    /// Metadata-only rewrite used by replication status write-back; the
    /// eval_metadata entries are folded into user metadata in place.
    async fn put_object_metadata(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo>;

    async fn new_multipart_upload(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<MultipartUploadResult>;
    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_id: usize,
        data: &mut PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<PartInfo>;
    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: usize,
        max_parts: usize,
        opts: &ObjectOptions,
    ) -> Result<ListPartsInfo>;
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo>;
    async fn complete_multipart_upload(
        self: Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        uploaded_parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo>;
    async fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &str, opts: &ObjectOptions) -> Result<()>;

    /// Walks every object version ascending by name, feeding `tx`.
    async fn walk(
        &self,
        cancel: CancellationToken,
        bucket: &str,
        prefix: &str,
        tx: Sender<ObjectInfoOrErr>,
        opts: WalkOptions,
    ) -> Result<()>;

    /// Records a degraded write so the scanner heals it later.
    async fn add_partial(&self, bucket: &str, object: &str, version_id: &str) -> Result<()>;

    async fn heal_bucket(&self, bucket: &str, opts: &HealOpts) -> Result<()>;
    async fn heal_object(&self, bucket: &str, object: &str, version_id: &str, opts: &HealOpts) -> Result<HealResultItem>;

    async fn get_disks(&self, pool_idx: usize, set_idx: usize) -> Result<Vec<Option<DiskStore>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HealOpts {
    pub recursive: bool,
    pub dry_run: bool,
    pub remove_corrupted: bool,
    pub recreate: bool,
}

#[derive(Debug, Default, Clone)]
pub struct HealResultItem {
    pub bucket: String,
    pub object: String,
    pub version_id: String,
    pub disk_count: usize,
    pub parity_blocks: usize,
    pub data_blocks: usize,
    pub before_drives: Vec<String>,
    pub after_drives: Vec<String>,
}

/// S3 multipart ETag: md5 of the concatenated part digests, suffixed with
/// the part count.
pub fn get_complete_multipart_md5(parts: &[CompletePart]) -> String {
    let mut all = Vec::with_capacity(parts.len() * 16);
    for part in parts {
        let etag = part.etag.clone().unwrap_or_default();
        let trimmed = garnetfs_utils::path::trim_etag(&etag);
        match hex::decode(&trimmed) {
            Ok(bytes) => all.extend_from_slice(&bytes),
            Err(_) => all.extend_from_slice(trimmed.as_bytes()),
        }
    }
    let mut hasher = Md5::new();
    hasher.update(&all);
    format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_etag_reader_matches_md5() {
        let payload = b"some payload".to_vec();
        let mut reader = PutObjReader::from_vec(payload.clone());
        let mut sink = Vec::new();
        tokio::io::copy(&mut reader.stream, &mut sink).await.unwrap();
        assert_eq!(sink, payload);

        let mut hasher = Md5::new();
        hasher.update(&payload);
        assert_eq!(reader.etag(), hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_complete_multipart_md5_suffix() {
        let parts = vec![
            CompletePart {
                part_num: 1,
                etag: Some("5d41402abc4b2a76b9719d911017c592".to_string()),
            },
            CompletePart {
                part_num: 2,
                etag: Some("7d793037a0760186574b0282f2f435e7".to_string()),
            },
        ];
        let etag = get_complete_multipart_md5(&parts);
        assert!(etag.ends_with("-2"));
        assert_eq!(etag.len(), 32 + 2);
    }

    #[test]
    fn test_range_spec() {
        let spec = HTTPRangeSpec::new(10, 19);
        assert_eq!(spec.get_offset_length(100).unwrap(), (10, 10));

        let open_ended = HTTPRangeSpec::new(90, -1);
        assert_eq!(open_ended.get_offset_length(100).unwrap(), (90, 10));

        let suffix = HTTPRangeSpec {
            start: 10,
            end: -1,
            suffix: true,
        };
        assert_eq!(suffix.get_offset_length(100).unwrap(), (90, 10));

        assert!(HTTPRangeSpec::new(100, -1).get_offset_length(100).is_err());
    }

    #[test]
    fn test_object_info_is_multipart() {
        let mut oi = ObjectInfo {
            etag: Some("5d41402abc4b2a76b9719d911017c592".to_string()),
            ..Default::default()
        };
        assert!(!oi.is_multipart());
        oi.etag = Some("5d41402abc4b2a76b9719d911017c592-3".to_string());
        assert!(oi.is_multipart());
    }
}

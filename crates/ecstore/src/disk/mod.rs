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

pub mod endpoint;
pub mod error;
pub mod error_reduce;
pub mod format;
pub mod fs;
pub mod local;

use endpoint::Endpoint;
use error::Result;
use garnetfs_filemeta::{FileInfo, FileInfoVersions, RawFileInfo};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub const GARNET_META_BUCKET: &str = ".garnet.sys";
pub const GARNET_META_MULTIPART_BUCKET: &str = ".garnet.sys/multipart";
pub const GARNET_META_TMP_BUCKET: &str = ".garnet.sys/tmp";
pub const GARNET_META_TMP_DELETED_BUCKET: &str = ".garnet.sys/tmp/.trash";
pub const BUCKET_META_PREFIX: &str = "buckets";
pub const FORMAT_CONFIG_FILE: &str = "format.json";
pub const STORAGE_FORMAT_FILE: &str = "xl.meta";

pub type DiskStore = Arc<dyn DiskAPI>;

/// Per-drive primitives every storage backend answers. One implementor
/// per mount; remote drives would proxy the same contract over the wire.
#[async_trait::async_trait]
pub trait DiskAPI: Debug + Send + Sync + 'static {
    fn to_string(&self) -> String;
    async fn is_online(&self) -> bool;
    fn is_local(&self) -> bool;
    fn host_name(&self) -> String;
    fn endpoint(&self) -> Endpoint;
    async fn close(&self) -> Result<()>;
    async fn get_disk_id(&self) -> Result<Option<Uuid>>;
    async fn set_disk_id(&self, id: Option<Uuid>) -> Result<()>;

    fn path(&self) -> PathBuf;

    // Volume operations.
    async fn make_volume(&self, volume: &str) -> Result<()>;
    async fn make_volumes(&self, volumes: Vec<&str>) -> Result<()>;
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;
    async fn stat_volume(&self, volume: &str) -> Result<VolumeInfo>;
    async fn delete_volume(&self, volume: &str) -> Result<()>;

    /// Recursive namespace walk yielding raw xl.meta entries in ascending
    /// name order.
    async fn walk_dir(&self, opts: WalkDirOptions) -> Result<Vec<MetaCacheEntry>>;

    // Metadata operations.
    async fn delete_version(&self, volume: &str, path: &str, fi: FileInfo, force_del_marker: bool, opts: DeleteOptions)
    -> Result<()>;
    async fn delete_versions(&self, volume: &str, versions: Vec<FileInfoVersions>, opts: DeleteOptions)
    -> Result<Vec<Option<error::Error>>>;
    async fn write_metadata(&self, org_volume: &str, volume: &str, path: &str, fi: FileInfo) -> Result<()>;
    async fn update_metadata(&self, volume: &str, path: &str, fi: FileInfo, opts: &UpdateMetadataOpts) -> Result<()>;
    async fn read_version(&self, org_volume: &str, volume: &str, path: &str, version_id: &str, opts: &ReadOptions)
    -> Result<FileInfo>;
    async fn read_xl(&self, volume: &str, path: &str, read_data: bool) -> Result<RawFileInfo>;
    async fn rename_data(&self, src_volume: &str, src_path: &str, fi: FileInfo, dst_volume: &str, dst_path: &str)
    -> Result<RenameDataResp>;

    // File operations.
    async fn list_dir(&self, org_volume: &str, volume: &str, dir_path: &str, count: i32) -> Result<Vec<String>>;
    async fn read_file_stream(&self, volume: &str, path: &str, offset: usize, length: usize)
    -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>>;
    async fn append_file(&self, volume: &str, path: &str) -> Result<Box<dyn AsyncWrite + Send + Sync + Unpin>>;
    async fn create_file(&self, org_volume: &str, volume: &str, path: &str, file_size: usize)
    -> Result<Box<dyn AsyncWrite + Send + Sync + Unpin>>;
    async fn rename_file(&self, src_volume: &str, src_path: &str, dst_volume: &str, dst_path: &str) -> Result<()>;
    async fn rename_part(&self, src_volume: &str, src_path: &str, dst_volume: &str, dst_path: &str, meta: Vec<u8>) -> Result<()>;
    async fn delete(&self, volume: &str, path: &str, opt: DeleteOptions) -> Result<()>;
    async fn verify_file(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp>;
    async fn check_parts(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp>;
    async fn read_multiple(&self, req: ReadMultipleReq) -> Result<Vec<ReadMultipleResp>>;
    async fn write_all(&self, volume: &str, path: &str, data: Vec<u8>) -> Result<()>;
    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>>;
    async fn disk_info(&self, opts: &DiskInfoOptions) -> Result<DiskInfo>;
}

pub async fn new_disk(ep: &Endpoint, opt: &DiskOption) -> Result<DiskStore> {
    let disk = local::LocalDisk::new(ep, opt.cleanup).await?;
    Ok(Arc::new(disk))
}

// Part check results, one slot per part.
pub const CHECK_PART_UNKNOWN: usize = 0;
pub const CHECK_PART_SUCCESS: usize = 1;
pub const CHECK_PART_DISK_NOT_FOUND: usize = 2;
pub const CHECK_PART_VOLUME_NOT_FOUND: usize = 3;
pub const CHECK_PART_FILE_NOT_FOUND: usize = 4;
pub const CHECK_PART_FILE_CORRUPT: usize = 5;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CheckPartsResp {
    pub results: Vec<usize>,
}

pub fn has_part_err(results: &[usize]) -> bool {
    results.iter().any(|&r| r != CHECK_PART_SUCCESS)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateMetadataOpts {
    pub no_persistence: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiskInfoOptions {
    pub disk_id: String,
    pub metrics: bool,
    pub noop: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_inodes: u64,
    pub free_inodes: u64,
    pub fs_type: String,
    pub root_disk: bool,
    pub healing: bool,
    pub endpoint: String,
    pub mount_path: String,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WalkDirOptions {
    pub bucket: String,
    pub base_dir: String,
    pub recursive: bool,
    pub report_notfound: bool,
    pub filter_prefix: Option<String>,
    /// Skip entries up to and including this object name.
    pub forward_to: Option<String>,
    pub limit: i32,
}

/// One object found by a namespace walk: the path plus its raw xl.meta.
#[derive(Debug, Default, Clone)]
pub struct MetaCacheEntry {
    pub name: String,
    pub metadata: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct DiskOption {
    pub cleanup: bool,
    pub health_check: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RenameDataResp {
    pub old_data_dir: Option<Uuid>,
    pub sign: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub immediate: bool,
    pub undo_write: bool,
    pub old_data_dir: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMultipleReq {
    pub bucket: String,
    pub prefix: String,
    pub files: Vec<String>,
    pub max_size: usize,
    pub metadata_only: bool,
    pub abort404: bool,
    pub max_results: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadMultipleResp {
    pub bucket: String,
    pub prefix: String,
    pub file: String,
    pub exists: bool,
    pub error: String,
    pub data: Vec<u8>,
    pub mod_time: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    pub created: Option<OffsetDateTime>,
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct ReadOptions {
    pub read_data: bool,
    pub healing: bool,
}

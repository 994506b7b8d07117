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

//! Object-layer errors. Per-drive `DiskError`s are reduced by quorum and
//! converted here with bucket/object context before crossing the erasure
//! boundary; replication errors never reach the original S3 caller.

use crate::disk::error::DiskError;

pub type Error = StorageError;
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("object not found: {0}/{1}")]
    ObjectNotFound(String, String),

    #[error("version not found: {0}/{1}({2})")]
    VersionNotFound(String, String, String),

    #[error("method not allowed: {0}/{1}")]
    MethodNotAllowed(String, String),

    #[error("invalid upload id: {0}/{1}-{2}")]
    InvalidUploadId(String, String, String),

    #[error("invalid part: {0}({1}, {2})")]
    InvalidPart(usize, String, String),

    #[error("part size for {0} is smaller than the minimum allowed ({1} < {2})")]
    EntityTooSmall(usize, i64, i64),

    #[error("invalid version id: {0}/{1}({2})")]
    InvalidVersionId(String, String, String),

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("not modified")]
    NotModified,

    #[error("read quorum not met, drives offline or faulty")]
    ErasureReadQuorum,

    #[error("write quorum not met, drives offline or faulty")]
    ErasureWriteQuorum,

    #[error("storage reached its minimum free drive threshold")]
    StorageFull,

    #[error("config not found")]
    ConfigNotFound,

    #[error("corrupted format")]
    CorruptedFormat,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("remote target not found: {0}")]
    RemoteTargetNotFound(String),

    #[error("remote target is offline: {0}")]
    RemoteTargetOffline(String),

    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn other<E: ToString>(err: E) -> Self {
        StorageError::Other(err.to_string())
    }
}

impl PartialEq for StorageError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StorageError::Io(a), StorageError::Io(b)) => a.to_string() == b.to_string(),
            (StorageError::Other(a), StorageError::Other(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<DiskError> for StorageError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::VolumeNotFound => StorageError::BucketNotFound(String::new()),
            DiskError::VolumeNotEmpty => StorageError::BucketNotEmpty(String::new()),
            DiskError::VolumeExists => StorageError::BucketExists(String::new()),
            DiskError::FileNotFound | DiskError::PathNotFound => StorageError::ObjectNotFound(String::new(), String::new()),
            DiskError::FileVersionNotFound => StorageError::VersionNotFound(String::new(), String::new(), String::new()),
            DiskError::MethodNotAllowed => StorageError::MethodNotAllowed(String::new(), String::new()),
            DiskError::ErasureReadQuorum => StorageError::ErasureReadQuorum,
            DiskError::ErasureWriteQuorum => StorageError::ErasureWriteQuorum,
            DiskError::DiskFull => StorageError::StorageFull,
            DiskError::CorruptedFormat => StorageError::CorruptedFormat,
            DiskError::Io(e) => StorageError::Io(e),
            other => StorageError::Other(other.to_string()),
        }
    }
}

impl From<garnetfs_filemeta::Error> for StorageError {
    fn from(err: garnetfs_filemeta::Error) -> Self {
        StorageError::from(DiskError::from(err))
    }
}

impl From<garnetfs_lock::LockError> for StorageError {
    fn from(err: garnetfs_lock::LockError) -> Self {
        StorageError::other(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Attaches bucket/object context to a reduced error.
pub fn to_object_err(err: StorageError, params: Vec<&str>) -> StorageError {
    let bucket = params.first().map(|s| s.to_string()).unwrap_or_default();
    let object = params.get(1).map(|s| s.to_string()).unwrap_or_default();
    let upload = params.get(2).map(|s| s.to_string()).unwrap_or_default();

    match err {
        StorageError::BucketNotFound(_) => StorageError::BucketNotFound(bucket),
        StorageError::BucketNotEmpty(_) => StorageError::BucketNotEmpty(bucket),
        StorageError::BucketExists(_) => StorageError::BucketExists(bucket),
        StorageError::ObjectNotFound(_, _) => StorageError::ObjectNotFound(bucket, object),
        StorageError::VersionNotFound(_, _, _) => StorageError::VersionNotFound(bucket, object, upload),
        StorageError::MethodNotAllowed(_, _) => StorageError::MethodNotAllowed(bucket, object),
        StorageError::InvalidUploadId(_, _, old) => StorageError::InvalidUploadId(bucket, object, old),
        other => other,
    }
}

pub fn is_err_object_not_found(err: &StorageError) -> bool {
    matches!(err, StorageError::ObjectNotFound(_, _))
}

pub fn is_err_version_not_found(err: &StorageError) -> bool {
    matches!(err, StorageError::VersionNotFound(_, _, _))
}

pub fn is_err_bucket_not_found(err: &StorageError) -> bool {
    matches!(err, StorageError::BucketNotFound(_))
}

pub fn is_err_read_quorum(err: &StorageError) -> bool {
    matches!(err, StorageError::ErasureReadQuorum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_error_conversion() {
        assert!(is_err_object_not_found(&StorageError::from(DiskError::FileNotFound)));
        assert!(is_err_version_not_found(&StorageError::from(DiskError::FileVersionNotFound)));
        assert!(is_err_read_quorum(&StorageError::from(DiskError::ErasureReadQuorum)));
    }

    #[test]
    fn test_to_object_err_attaches_context() {
        let err = to_object_err(StorageError::from(DiskError::FileNotFound), vec!["bucket", "object"]);
        assert_eq!(err, StorageError::ObjectNotFound("bucket".to_string(), "object".to_string()));
        assert_eq!(err.to_string(), "object not found: bucket/object");
    }
}

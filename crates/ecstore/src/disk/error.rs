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

use std::io;

pub type Error = DiskError;
pub type Result<T> = core::result::Result<T, Error>;

/// Per-drive error taxonomy. Everything a drive can report reduces to one
/// of these before quorum reduction runs over the per-drive results.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("unexpected error")]
    Unexpected,

    #[error("corrupted format")]
    CorruptedFormat,

    #[error("unformatted disk found")]
    UnformattedDisk,

    #[error("inconsistent drive found")]
    InconsistentDisk,

    #[error("drive path full")]
    DiskFull,

    #[error("disk not found")]
    DiskNotFound,

    #[error("drive still did not complete the request")]
    DiskOngoingReq,

    #[error("remote drive is faulty")]
    FaultyRemoteDisk,

    #[error("drive is faulty")]
    FaultyDisk,

    #[error("drive access denied")]
    DiskAccessDenied,

    #[error("file not found")]
    FileNotFound,

    #[error("file version not found")]
    FileVersionNotFound,

    #[error("file name too long")]
    FileNameTooLong,

    #[error("volume already exists")]
    VolumeExists,

    #[error("not of regular file type")]
    IsNotRegular,

    #[error("path not found")]
    PathNotFound,

    #[error("volume not found")]
    VolumeNotFound,

    #[error("volume is not empty")]
    VolumeNotEmpty,

    #[error("volume access denied")]
    VolumeAccessDenied,

    #[error("file access denied")]
    FileAccessDenied,

    #[error("file is corrupted")]
    FileCorrupt,

    #[error("short write")]
    ShortWrite,

    #[error("bit-rot hash algorithm is invalid")]
    BitrotHashAlgoInvalid,

    #[error("less data available than what was requested")]
    LessData,

    #[error("more data was sent than what was advertised")]
    MoreData,

    #[error("done for now")]
    DoneForNow,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("erasure write quorum")]
    ErasureWriteQuorum,

    #[error("erasure read quorum")]
    ErasureReadQuorum,

    #[error("drive timed out")]
    Timeout,

    #[error("invalid path")]
    InvalidPath,

    #[error("io error {0}")]
    Io(io::Error),
}

impl DiskError {
    pub fn other<E: ToString>(err: E) -> Self {
        DiskError::Io(io::Error::other(err.to_string()))
    }
}

impl PartialEq for DiskError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DiskError::Io(a), DiskError::Io(b)) => a.kind() == b.kind() && a.to_string() == b.to_string(),
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl Eq for DiskError {}

impl std::hash::Hash for DiskError {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        if let DiskError::Io(e) = self {
            e.to_string().hash(state);
        }
    }
}

impl Clone for DiskError {
    fn clone(&self) -> Self {
        match self {
            DiskError::Io(e) => DiskError::Io(io::Error::new(e.kind(), e.to_string())),
            DiskError::Unexpected => DiskError::Unexpected,
            DiskError::CorruptedFormat => DiskError::CorruptedFormat,
            DiskError::UnformattedDisk => DiskError::UnformattedDisk,
            DiskError::InconsistentDisk => DiskError::InconsistentDisk,
            DiskError::DiskFull => DiskError::DiskFull,
            DiskError::DiskNotFound => DiskError::DiskNotFound,
            DiskError::DiskOngoingReq => DiskError::DiskOngoingReq,
            DiskError::FaultyRemoteDisk => DiskError::FaultyRemoteDisk,
            DiskError::FaultyDisk => DiskError::FaultyDisk,
            DiskError::DiskAccessDenied => DiskError::DiskAccessDenied,
            DiskError::FileNotFound => DiskError::FileNotFound,
            DiskError::FileVersionNotFound => DiskError::FileVersionNotFound,
            DiskError::FileNameTooLong => DiskError::FileNameTooLong,
            DiskError::VolumeExists => DiskError::VolumeExists,
            DiskError::IsNotRegular => DiskError::IsNotRegular,
            DiskError::PathNotFound => DiskError::PathNotFound,
            DiskError::VolumeNotFound => DiskError::VolumeNotFound,
            DiskError::VolumeNotEmpty => DiskError::VolumeNotEmpty,
            DiskError::VolumeAccessDenied => DiskError::VolumeAccessDenied,
            DiskError::FileAccessDenied => DiskError::FileAccessDenied,
            DiskError::FileCorrupt => DiskError::FileCorrupt,
            DiskError::ShortWrite => DiskError::ShortWrite,
            DiskError::BitrotHashAlgoInvalid => DiskError::BitrotHashAlgoInvalid,
            DiskError::LessData => DiskError::LessData,
            DiskError::MoreData => DiskError::MoreData,
            DiskError::DoneForNow => DiskError::DoneForNow,
            DiskError::MethodNotAllowed => DiskError::MethodNotAllowed,
            DiskError::ErasureWriteQuorum => DiskError::ErasureWriteQuorum,
            DiskError::ErasureReadQuorum => DiskError::ErasureReadQuorum,
            DiskError::Timeout => DiskError::Timeout,
            DiskError::InvalidPath => DiskError::InvalidPath,
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => DiskError::FileNotFound,
            io::ErrorKind::PermissionDenied => DiskError::FileAccessDenied,
            io::ErrorKind::StorageFull => DiskError::DiskFull,
            io::ErrorKind::InvalidFilename => DiskError::FileNameTooLong,
            _ => DiskError::Io(err),
        }
    }
}

impl From<garnetfs_filemeta::Error> for DiskError {
    fn from(err: garnetfs_filemeta::Error) -> Self {
        match err {
            garnetfs_filemeta::Error::FileNotFound => DiskError::FileNotFound,
            garnetfs_filemeta::Error::FileVersionNotFound => DiskError::FileVersionNotFound,
            garnetfs_filemeta::Error::FileCorrupt => DiskError::FileCorrupt,
            garnetfs_filemeta::Error::MethodNotAllowed => DiskError::MethodNotAllowed,
            garnetfs_filemeta::Error::DoneForNow => DiskError::DoneForNow,
            garnetfs_filemeta::Error::Unexpected(msg) => DiskError::other(msg),
        }
    }
}

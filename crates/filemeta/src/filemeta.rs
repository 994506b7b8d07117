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

//! The `xl.meta` container. One file per object per drive, holding every
//! version of the object. Mutations are whole-file rewrites under the
//! namespace write lock; readers get a consistent snapshot per drive and
//! the set layer reconciles drives by quorum.

use crate::fileinfo::{FileInfo, FileInfoVersions};
use crate::{Error, Result};
use bytes::Bytes;
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Magic bytes prefixed to every serialized xl.meta.
pub const XL_META_MAGIC: &[u8; 4] = b"GFS2";
pub const XL_META_VERSION: u16 = 1;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum VersionType {
    #[default]
    Invalid,
    Object,
    Delete,
}

/// Compact per-version header used to sort and match versions across
/// drives without decoding the full metadata record.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct VersionHeader {
    pub version_id: Option<Uuid>,
    pub mod_time: Option<OffsetDateTime>,
    pub signature: [u8; 4],
    pub version_type: VersionType,
    pub ec_n: u8,
    pub ec_m: u8,
}

impl VersionHeader {
    pub fn matches_not_strict(&self, other: &Self) -> bool {
        self.version_id == other.version_id && self.version_type == other.version_type
    }

    /// Strict match also requires identical content signature and time.
    pub fn matches(&self, other: &Self, strict: bool) -> bool {
        if !strict {
            return self.matches_not_strict(other);
        }
        self.version_id == other.version_id
            && self.mod_time == other.mod_time
            && self.version_type == other.version_type
            && self.signature == other.signature
    }

    pub fn sorts_before(&self, other: &Self) -> bool {
        match (self.mod_time, other.mod_time) {
            (Some(a), Some(b)) if a != b => a > b,
            _ => self.version_id > other.version_id,
        }
    }

    pub fn free_version(&self) -> bool {
        false
    }
}

/// One version inside xl.meta: the header plus the serialized FileInfo.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct FileMetaShallowVersion {
    pub header: VersionHeader,
    pub meta: Vec<u8>,
}

impl FileMetaShallowVersion {
    pub fn from_file_info(fi: &FileInfo) -> Result<Self> {
        let mut stripped = fi.clone();
        stripped.data = None;
        let meta = stripped.marshal_msg()?;

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&crc32fast::hash(&meta).to_le_bytes());

        Ok(Self {
            header: VersionHeader {
                version_id: fi.version_id,
                mod_time: fi.mod_time,
                signature,
                version_type: if fi.deleted { VersionType::Delete } else { VersionType::Object },
                ec_n: fi.erasure.data_blocks as u8,
                ec_m: fi.erasure.parity_blocks as u8,
            },
            meta,
        })
    }

    pub fn to_file_info(&self) -> Result<FileInfo> {
        FileInfo::unmarshal(&self.meta)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct FileMeta {
    pub meta_ver: u16,
    /// Versions sorted by mod time, newest first.
    pub versions: Vec<FileMetaShallowVersion>,
    /// Inline shard payloads keyed by version id (or data dir for the
    /// unversioned case).
    pub data: HashMap<String, Bytes>,
}

impl FileMeta {
    pub fn new() -> Self {
        Self {
            meta_ver: XL_META_VERSION,
            ..Default::default()
        }
    }

    pub fn is_xl2_format(buf: &[u8]) -> bool {
        buf.len() > 8 && &buf[..4] == XL_META_MAGIC
    }

    pub fn marshal_msg(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(XL_META_MAGIC);
        buf.extend_from_slice(&XL_META_VERSION.to_le_bytes());
        self.serialize(&mut Serializer::new(&mut buf))?;
        Ok(buf)
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        if !Self::is_xl2_format(buf) {
            return Err(Error::FileCorrupt);
        }
        let meta: FileMeta = rmp_serde::from_slice(&buf[6..])?;
        Ok(meta)
    }

    fn data_key(fi: &FileInfo) -> String {
        if let Some(vid) = fi.version_id {
            vid.to_string()
        } else {
            NULL_DATA_KEY.to_string()
        }
    }

    pub fn find_version(&self, version_id: Option<Uuid>) -> Result<(usize, &FileMetaShallowVersion)> {
        for (i, ver) in self.versions.iter().enumerate() {
            if ver.header.version_id == version_id {
                return Ok((i, ver));
            }
        }
        Err(Error::FileVersionNotFound)
    }

    /// Inserts or replaces a version, keeping the newest-first order.
    pub fn add_version(&mut self, fi: FileInfo) -> Result<()> {
        if let Some(data) = fi.data.clone() {
            self.data.insert(Self::data_key(&fi), data);
        }

        let ver = FileMetaShallowVersion::from_file_info(&fi)?;

        if let Ok((idx, _)) = self.find_version(fi.version_id) {
            self.versions[idx] = ver;
        } else {
            let pos = self
                .versions
                .iter()
                .position(|v| ver.header.sorts_before(&v.header))
                .unwrap_or(self.versions.len());
            self.versions.insert(pos, ver);
        }

        Ok(())
    }

    /// Removes a version. Returns the data dir that can be reclaimed once
    /// no other version references it.
    pub fn delete_version(&mut self, fi: &FileInfo) -> Result<Option<Uuid>> {
        let (idx, ver) = self.find_version(fi.version_id)?;
        let old = ver.to_file_info()?;

        self.versions.remove(idx);
        self.data.remove(&Self::data_key(fi));

        if let Some(data_dir) = old.data_dir {
            let still_used = self.versions.iter().any(|v| {
                v.to_file_info()
                    .map(|f| f.data_dir == Some(data_dir))
                    .unwrap_or(false)
            });
            if !still_used {
                return Ok(Some(data_dir));
            }
        }

        Ok(None)
    }

    /// Reads one version out as FileInfo, resolving `latest` when no
    /// version id is requested.
    pub fn to_file_info(&self, volume: &str, path: &str, version_id: Option<Uuid>, read_data: bool) -> Result<FileInfo> {
        let (idx, ver) = if version_id.is_none() {
            if self.versions.is_empty() {
                return Err(Error::FileNotFound);
            }
            (0, &self.versions[0])
        } else {
            self.find_version(version_id)?
        };

        let mut fi = ver.to_file_info()?;
        fi.volume = volume.to_string();
        fi.name = path.to_string();
        fi.is_latest = idx == 0;
        fi.num_versions = self.versions.len();
        if idx > 0 {
            fi.successor_mod_time = self.versions[idx - 1].header.mod_time;
        }
        if read_data {
            fi.data = self.data.get(&Self::data_key(&fi)).cloned();
        }
        Ok(fi)
    }

    /// All versions newest first, for listing and resync walks.
    pub fn into_file_info_versions(&self, volume: &str, path: &str) -> Result<FileInfoVersions> {
        let mut versions = Vec::with_capacity(self.versions.len());
        for (idx, ver) in self.versions.iter().enumerate() {
            let mut fi = ver.to_file_info()?;
            fi.volume = volume.to_string();
            fi.name = path.to_string();
            fi.is_latest = idx == 0;
            fi.num_versions = self.versions.len();
            if idx > 0 {
                fi.successor_mod_time = self.versions[idx - 1].header.mod_time;
            }
            versions.push(fi);
        }

        Ok(FileInfoVersions {
            volume: volume.to_string(),
            name: path.to_string(),
            latest_mod_time: versions.first().and_then(|v| v.mod_time),
            versions,
            ..Default::default()
        })
    }

    pub fn latest_mod_time(&self) -> Option<OffsetDateTime> {
        self.versions.first().and_then(|v| v.header.mod_time)
    }
}

const NULL_DATA_KEY: &str = "null";

/// Merges per-drive version lists, keeping the versions that at least
/// `quorum` drives agree on. Drives that are healing or stale contribute
/// fewer entries and fall out naturally.
pub fn merge_file_meta_versions(
    quorum: usize,
    strict: bool,
    requested_versions: usize,
    versions: &[Vec<FileMetaShallowVersion>],
) -> Vec<FileMetaShallowVersion> {
    if quorum <= 1 {
        // With no quorum to satisfy, take the longest list.
        return versions.iter().max_by_key(|v| v.len()).cloned().unwrap_or_default();
    }

    let mut merged: Vec<FileMetaShallowVersion> = Vec::new();
    let mut cursors = vec![0usize; versions.len()];

    loop {
        // Find the top candidate among the drive cursors.
        let mut top: Option<&FileMetaShallowVersion> = None;
        for (i, vers) in versions.iter().enumerate() {
            if let Some(ver) = vers.get(cursors[i]) {
                match top {
                    Some(t) if !ver.header.sorts_before(&t.header) => {}
                    _ => top = Some(ver),
                }
            }
        }

        let Some(top) = top.cloned() else {
            break;
        };

        let mut count = 0;
        for (i, vers) in versions.iter().enumerate() {
            if let Some(ver) = vers.get(cursors[i]) {
                if ver.header.matches(&top.header, strict) {
                    count += 1;
                    cursors[i] += 1;
                }
            }
        }

        if count >= quorum {
            merged.push(top);
            if requested_versions > 0 && merged.len() >= requested_versions {
                break;
            }
        }
    }

    merged
}

/// Decodes the raw xl.meta buffer a drive returned into the FileInfo for
/// one version.
pub fn file_info_from_raw(raw: &crate::fileinfo::RawFileInfo, volume: &str, path: &str, read_data: bool) -> Result<FileInfo> {
    let meta = FileMeta::load(&raw.buf)?;
    meta.to_file_info(volume, path, None, read_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fi(vid: Option<Uuid>, ts: i64) -> FileInfo {
        let mut fi = FileInfo::new("b/o", 2, 2);
        fi.version_id = vid;
        fi.mod_time = Some(OffsetDateTime::from_unix_timestamp(ts).unwrap());
        fi
    }

    #[test]
    fn test_add_find_delete_version() {
        let mut fm = FileMeta::new();
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        fm.add_version(fi(Some(v1), 100)).unwrap();
        fm.add_version(fi(Some(v2), 200)).unwrap();

        // Newest first.
        assert_eq!(fm.versions[0].header.version_id, Some(v2));
        assert_eq!(fm.versions.len(), 2);

        let latest = fm.to_file_info("b", "o", None, false).unwrap();
        assert_eq!(latest.version_id, Some(v2));
        assert!(latest.is_latest);

        fm.delete_version(&fi(Some(v2), 200)).unwrap();
        assert_eq!(fm.versions.len(), 1);
        assert!(fm.find_version(Some(v2)).is_err());
    }

    #[test]
    fn test_marshal_round_trip() {
        let mut fm = FileMeta::new();
        fm.add_version(fi(Some(Uuid::new_v4()), 10)).unwrap();
        let buf = fm.marshal_msg().unwrap();
        assert!(FileMeta::is_xl2_format(&buf));
        let got = FileMeta::load(&buf).unwrap();
        assert_eq!(fm, got);
    }

    #[test]
    fn test_merge_requires_quorum() {
        let v_old = fi(Some(Uuid::new_v4()), 100);
        let v_new = fi(Some(Uuid::new_v4()), 200);

        let old_ver = FileMetaShallowVersion::from_file_info(&v_old).unwrap();
        let new_ver = FileMetaShallowVersion::from_file_info(&v_new).unwrap();

        // Three drives have both versions, one lagging drive misses the
        // newest. Quorum 3 keeps both; quorum 4 drops the newest.
        let drives = vec![
            vec![new_ver.clone(), old_ver.clone()],
            vec![new_ver.clone(), old_ver.clone()],
            vec![new_ver.clone(), old_ver.clone()],
            vec![old_ver.clone()],
        ];

        let merged = merge_file_meta_versions(3, true, 0, &drives);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].header, new_ver.header);

        let merged = merge_file_meta_versions(4, true, 0, &drives);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].header, old_ver.header);
    }

    #[test]
    fn test_merge_prefers_newest() {
        let a = FileMetaShallowVersion::from_file_info(&fi(Some(Uuid::new_v4()), 50)).unwrap();
        let b = FileMetaShallowVersion::from_file_info(&fi(Some(Uuid::new_v4()), 300)).unwrap();
        let drives = vec![vec![b.clone(), a.clone()], vec![b.clone(), a.clone()]];
        let merged = merge_file_meta_versions(2, true, 1, &drives);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].header, b.header);
    }
}

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

use crate::replication::{ReplicationState, ReplicationStatusType, VersionPurgeStatusType};
use crate::{Error, Result};
use bytes::Bytes;
use garnetfs_utils::HashAlgorithm;
use garnetfs_utils::http::RESERVED_METADATA_PREFIX_LOWER;
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

pub const ERASURE_ALGORITHM: &str = "rs-vandermonde";
pub const BLOCK_SIZE_V2: usize = 1024 * 1024; // 1M

/// Version id S3 clients use to address the unversioned version.
pub const NULL_VERSION_ID: &str = "null";

/// One part of an object as stored on a single drive.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct ObjectPartInfo {
    pub etag: String,
    pub number: usize,
    pub size: usize,
    /// Original size of the data uploaded by the client, before any
    /// transform applied on the wire.
    pub actual_size: i64,
    pub mod_time: Option<OffsetDateTime>,
    pub index: Option<Bytes>,
    pub checksums: Option<HashMap<String, String>>,
    pub error: Option<String>,
}

impl ObjectPartInfo {
    pub fn marshal_msg(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(&mut Serializer::new(&mut buf))?;
        Ok(buf)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}

/// ChecksumInfo carries the bitrot checksum of one scattered part on one drive.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ChecksumInfo {
    pub part_number: usize,
    pub algorithm: HashAlgorithm,
    pub hash: Bytes,
}

/// ErasureInfo holds erasure coding and bitrot related information.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ErasureInfo {
    pub algorithm: String,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub block_size: usize,
    /// Position of this drive within the distribution, 1-based.
    pub index: usize,
    /// Permutation of shard positions across the set for this object.
    pub distribution: Vec<usize>,
    pub checksums: Vec<ChecksumInfo>,
}

pub fn calc_shard_size(block_size: usize, data_shards: usize) -> usize {
    (block_size.div_ceil(data_shards) + 1) & !1
}

impl ErasureInfo {
    pub fn get_checksum_info(&self, part_number: usize) -> ChecksumInfo {
        for sum in &self.checksums {
            if sum.part_number == part_number {
                return sum.clone();
            }
        }

        ChecksumInfo {
            algorithm: HashAlgorithm::HighwayHash256,
            ..Default::default()
        }
    }

    /// Size of each erasure shard block, even-aligned.
    pub fn shard_size(&self) -> usize {
        calc_shard_size(self.block_size, self.data_blocks)
    }

    /// Final on-disk shard file size for an object of `total_length` bytes.
    pub fn shard_file_size(&self, total_length: i64) -> i64 {
        if total_length <= 0 {
            return total_length;
        }

        let total_length = total_length as usize;
        let num_shards = total_length / self.block_size;
        let last_block_size = total_length % self.block_size;
        let last_shard_size = calc_shard_size(last_block_size, self.data_blocks);
        (num_shards * self.shard_size() + last_shard_size) as i64
    }

    pub fn equals(&self, other: &ErasureInfo) -> bool {
        self.algorithm == other.algorithm
            && self.data_blocks == other.data_blocks
            && self.parity_blocks == other.parity_blocks
            && self.block_size == other.block_size
            && self.index == other.index
            && self.distribution == other.distribution
    }
}

/// FileInfo is the per-drive view of a single object version.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct FileInfo {
    pub volume: String,
    pub name: String,
    pub version_id: Option<Uuid>,
    pub is_latest: bool,
    /// Set when this version is a delete marker.
    pub deleted: bool,
    pub transition_status: String,
    pub data_dir: Option<Uuid>,
    pub mod_time: Option<OffsetDateTime>,
    pub size: i64,
    pub metadata: HashMap<String, String>,
    pub parts: Vec<ObjectPartInfo>,
    pub erasure: ErasureInfo,
    pub mark_deleted: bool,
    /// Internal replication state handed back in ObjectInfo.
    pub replication_state_internal: Option<ReplicationState>,
    /// Inline shard payload for small objects.
    pub data: Option<Bytes>,
    pub num_versions: usize,
    pub successor_mod_time: Option<OffsetDateTime>,
    pub fresh: bool,
    pub idx: usize,
    pub checksum: Option<Bytes>,
    pub versioned: bool,
}

impl FileInfo {
    /// Creates a FileInfo with a distribution derived from the object name,
    /// so parity positions rotate across objects.
    pub fn new(object: &str, data_blocks: usize, parity_blocks: usize) -> Self {
        let distribution = {
            let cardinality = data_blocks + parity_blocks;
            let mut nums = vec![0; cardinality];
            let key_crc = crc32fast::hash(object.as_bytes());

            let start = key_crc as usize % cardinality;
            for i in 1..=cardinality {
                nums[i - 1] = 1 + ((start + i) % cardinality);
            }

            nums
        };
        Self {
            erasure: ErasureInfo {
                algorithm: String::from(ERASURE_ALGORITHM),
                data_blocks,
                parity_blocks,
                block_size: BLOCK_SIZE_V2,
                distribution,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.deleted {
            // Delete markers have no erasure descriptor.
            return true;
        }

        let data_blocks = self.erasure.data_blocks;
        let parity_blocks = self.erasure.parity_blocks;

        (data_blocks >= parity_blocks)
            && (data_blocks > 0)
            && (self.erasure.index > 0
                && self.erasure.index <= data_blocks + parity_blocks
                && self.erasure.distribution.len() == (data_blocks + parity_blocks))
    }

    pub fn get_etag(&self) -> Option<String> {
        self.metadata.get("etag").cloned()
    }

    pub fn write_quorum(&self, quorum: usize) -> usize {
        if self.deleted {
            return quorum;
        }

        if self.erasure.data_blocks == self.erasure.parity_blocks {
            return self.erasure.data_blocks + 1;
        }

        self.erasure.data_blocks
    }

    pub fn read_quorum(&self, quorum: usize) -> usize {
        if self.deleted {
            return quorum;
        }
        self.erasure.data_blocks
    }

    pub fn marshal_msg(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(&mut Serializer::new(&mut buf))?;
        Ok(buf)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(buf)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_object_part(
        &mut self,
        num: usize,
        etag: String,
        part_size: usize,
        mod_time: Option<OffsetDateTime>,
        actual_size: i64,
        index: Option<Bytes>,
        checksums: Option<HashMap<String, String>>,
    ) {
        let part = ObjectPartInfo {
            etag,
            number: num,
            size: part_size,
            mod_time,
            actual_size,
            index,
            checksums,
            error: None,
        };

        for p in self.parts.iter_mut() {
            if p.number == num {
                *p = part;
                return;
            }
        }

        self.parts.push(part);
        self.parts.sort_by(|a, b| a.number.cmp(&b.number));
    }

    /// Maps an absolute object offset to (part index, offset within part).
    pub fn to_part_offset(&self, offset: usize) -> Result<(usize, usize)> {
        if offset == 0 {
            return Ok((0, 0));
        }

        let mut part_offset = offset;
        for (i, part) in self.parts.iter().enumerate() {
            if part_offset < part.size {
                return Ok((i, part_offset));
            }
            part_offset -= part.size
        }

        Err(Error::other("part not found"))
    }

    pub fn inline_data(&self) -> bool {
        self.metadata
            .contains_key(&format!("{RESERVED_METADATA_PREFIX_LOWER}inline-data"))
    }

    pub fn set_inline_data(&mut self) {
        self.metadata
            .insert(format!("{RESERVED_METADATA_PREFIX_LOWER}inline-data"), "true".to_string());
    }

    pub fn set_data_moved(&mut self) {
        self.metadata
            .insert(format!("{RESERVED_METADATA_PREFIX_LOWER}data-moved"), "true".to_string());
    }

    pub fn is_compressed(&self) -> bool {
        self.metadata
            .contains_key(&format!("{RESERVED_METADATA_PREFIX_LOWER}compression"))
    }

    pub fn replication_status(&self) -> ReplicationStatusType {
        self.replication_state_internal
            .as_ref()
            .map(|rs| rs.composite_replication_status())
            .unwrap_or_default()
    }

    pub fn version_purge_status(&self) -> VersionPurgeStatusType {
        self.replication_state_internal
            .as_ref()
            .map(|rs| rs.composite_version_purge_status())
            .unwrap_or_default()
    }

    /// A version is permanently removable only after every target purged it.
    pub fn delete_version_allowed(&self) -> bool {
        self.version_purge_status() != VersionPurgeStatusType::Pending
            && self.version_purge_status() != VersionPurgeStatusType::Failed
    }

    pub fn get_actual_size(&self) -> Result<i64> {
        if let Some(size_str) = self.metadata.get(&format!("{RESERVED_METADATA_PREFIX_LOWER}actual-size")) {
            if !size_str.is_empty() {
                return size_str.parse::<i64>().map_err(Error::other);
            }
        }

        if self.is_compressed() {
            let actual_size: i64 = self.parts.iter().map(|p| p.actual_size).sum();
            if actual_size == 0 && actual_size != self.size {
                return Err(Error::other("invalid decompressed size"));
            }
            return Ok(actual_size);
        }

        Ok(self.size)
    }
}

/// All versions of one object on one drive, newest first.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FileInfoVersions {
    pub volume: String,
    pub name: String,
    pub is_empty_dir: bool,
    pub latest_mod_time: Option<OffsetDateTime>,
    pub versions: Vec<FileInfo>,
    pub free_versions: Vec<FileInfo>,
}

impl FileInfoVersions {
    pub fn find_version_index(&self, vid: Uuid) -> Option<usize> {
        self.versions.iter().position(|v| v.version_id == Some(vid))
    }
}

/// Raw xl.meta bytes as returned by a drive, decoded lazily.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RawFileInfo {
    pub buf: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_is_a_permutation() {
        let fi = FileInfo::new("bucket/object", 12, 4);
        let mut seen = fi.erasure.distribution.clone();
        seen.sort_unstable();
        assert_eq!(seen, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn test_shard_file_size() {
        let fi = FileInfo::new("b/o", 4, 2);
        let shard = fi.erasure.shard_size();
        assert_eq!(fi.erasure.shard_file_size(0), 0);
        // One full block spans exactly one shard per drive.
        assert_eq!(fi.erasure.shard_file_size(BLOCK_SIZE_V2 as i64), shard as i64);
        // A trailing partial block adds a partial shard.
        let sz = fi.erasure.shard_file_size(BLOCK_SIZE_V2 as i64 + 10);
        assert_eq!(sz, (shard + calc_shard_size(10, 4)) as i64);
    }

    #[test]
    fn test_write_quorum() {
        let fi = FileInfo::new("b/o", 8, 8);
        assert_eq!(fi.write_quorum(8), 9);
        let fi = FileInfo::new("b/o", 12, 4);
        assert_eq!(fi.write_quorum(12), 12);
    }

    #[test]
    fn test_add_object_part_sorted_and_replaced() {
        let mut fi = FileInfo::new("b/o", 4, 2);
        fi.add_object_part(2, "e2".into(), 10, None, 10, None, None);
        fi.add_object_part(1, "e1".into(), 10, None, 10, None, None);
        fi.add_object_part(2, "e2b".into(), 12, None, 12, None, None);
        assert_eq!(fi.parts.len(), 2);
        assert_eq!(fi.parts[0].number, 1);
        assert_eq!(fi.parts[1].etag, "e2b");
    }

    #[test]
    fn test_marshal_round_trip() {
        let mut fi = FileInfo::new("b/o", 4, 2);
        fi.version_id = Some(Uuid::new_v4());
        fi.size = 42;
        let buf = fi.marshal_msg().unwrap();
        let got = FileInfo::unmarshal(&buf).unwrap();
        assert_eq!(fi, got);
    }
}

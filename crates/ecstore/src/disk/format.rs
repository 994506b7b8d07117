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

//! `format.json` identifies a drive and pins the set topology it belongs
//! to. It is written once at format time and checked on every mount.

use super::error::{DiskError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FORMAT_BACKEND_ERASURE: &str = "xl";
pub const FORMAT_META_VERSION: &str = "1";
pub const FORMAT_ERASURE_VERSION: &str = "3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistributionAlgoVersion {
    V1,
    V2,
    #[default]
    V3,
}

/// Erasure-backend section of format.json.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FormatErasure {
    pub version: String,
    /// UUID of the drive this file lives on.
    pub this: Uuid,
    /// Drive UUIDs per set; outer index is the set within the pool.
    pub sets: Vec<Vec<Uuid>>,
    #[serde(rename = "distributionAlgo")]
    pub distribution_algo: DistributionAlgoVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FormatV3 {
    pub version: String,
    pub format: String,
    pub id: Uuid,
    #[serde(rename = "xl")]
    pub erasure: FormatErasure,
}

impl FormatV3 {
    pub fn new(num_sets: usize, set_drive_count: usize) -> Self {
        let mut sets = Vec::with_capacity(num_sets);
        for _ in 0..num_sets {
            sets.push((0..set_drive_count).map(|_| Uuid::new_v4()).collect());
        }

        Self {
            version: FORMAT_META_VERSION.to_string(),
            format: FORMAT_BACKEND_ERASURE.to_string(),
            id: Uuid::new_v4(),
            erasure: FormatErasure {
                version: FORMAT_ERASURE_VERSION.to_string(),
                this: Uuid::nil(),
                sets,
                distribution_algo: DistributionAlgoVersion::V3,
            },
        }
    }

    pub fn drive_count(&self) -> usize {
        self.erasure.sets.iter().map(|s| s.len()).sum()
    }

    /// Locates this drive's (set, slot) within the layout.
    pub fn find_disk_index_by_disk_id(&self, disk_id: Uuid) -> Result<(usize, usize)> {
        if disk_id.is_nil() {
            return Err(DiskError::DiskNotFound);
        }

        for (set_idx, set) in self.erasure.sets.iter().enumerate() {
            for (disk_idx, id) in set.iter().enumerate() {
                if *id == disk_id {
                    return Ok((set_idx, disk_idx));
                }
            }
        }

        Err(DiskError::InconsistentDisk)
    }

    /// Two formats belong together when deployment id and layout agree.
    pub fn matches(&self, other: &FormatV3) -> Result<()> {
        if self.id != other.id {
            return Err(DiskError::InconsistentDisk);
        }
        if self.erasure.sets.len() != other.erasure.sets.len() {
            return Err(DiskError::InconsistentDisk);
        }
        for (a, b) in self.erasure.sets.iter().zip(other.erasure.sets.iter()) {
            if a != b {
                return Err(DiskError::InconsistentDisk);
            }
        }
        Ok(())
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|_| DiskError::CorruptedFormat)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let format: FormatV3 = serde_json::from_slice(buf).map_err(|_| DiskError::CorruptedFormat)?;
        if format.format != FORMAT_BACKEND_ERASURE {
            return Err(DiskError::CorruptedFormat);
        }
        Ok(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip() {
        let format = FormatV3::new(2, 4);
        assert_eq!(format.drive_count(), 8);
        let buf = format.marshal().unwrap();
        let got = FormatV3::unmarshal(&buf).unwrap();
        assert_eq!(format.id, got.id);
        assert_eq!(format.erasure.sets, got.erasure.sets);
    }

    #[test]
    fn test_find_disk_index() {
        let format = FormatV3::new(2, 4);
        let target = format.erasure.sets[1][3];
        assert_eq!(format.find_disk_index_by_disk_id(target).unwrap(), (1, 3));
        assert!(format.find_disk_index_by_disk_id(Uuid::new_v4()).is_err());
        assert!(format.find_disk_index_by_disk_id(Uuid::nil()).is_err());
    }
}

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

pub const STANDARD: &str = "STANDARD";
pub const RRS: &str = "REDUCED_REDUNDANCY";

/// Objects at or below this size keep their shards inline in xl.meta.
pub const INLINE_BLOCK_THRESHOLD: i64 = 128 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct StorageClassConfig {
    pub standard_parity: usize,
    pub rrs_parity: usize,
}

impl Default for StorageClassConfig {
    fn default() -> Self {
        Self {
            standard_parity: 0,
            rrs_parity: 1,
        }
    }
}

impl StorageClassConfig {
    /// Parity override for a storage class header value; zero means use
    /// the set default.
    pub fn get_parity_for_sc(&self, sc: &str) -> Option<usize> {
        match sc {
            RRS if self.rrs_parity > 0 => Some(self.rrs_parity),
            STANDARD if self.standard_parity > 0 => Some(self.standard_parity),
            _ => None,
        }
    }

    pub fn should_inline(&self, shard_size: i64, versioned: bool) -> bool {
        shard_size >= 0 && shard_size <= INLINE_BLOCK_THRESHOLD && versioned
    }
}

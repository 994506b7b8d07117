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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A drive location within the topology: which pool, which set, which
/// slot, and where the mount lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Filesystem path of the mount (or URL path for a remote drive).
    pub path: String,
    pub is_local: bool,
    pub pool_idx: i32,
    pub set_idx: i32,
    pub disk_idx: i32,
}

impl Endpoint {
    pub fn new_local(path: &str) -> Self {
        Self {
            path: path.to_string(),
            is_local: true,
            pool_idx: -1,
            set_idx: -1,
            disk_idx: -1,
        }
    }

    pub fn set_location(&mut self, pool_idx: usize, set_idx: usize, disk_idx: usize) {
        self.pool_idx = pool_idx as i32;
        self.set_idx = set_idx as i32;
        self.disk_idx = disk_idx as i32;
    }

    pub fn get_file_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_location() {
        let mut ep = Endpoint::new_local("/mnt/drive1");
        assert_eq!(ep.pool_idx, -1);
        ep.set_location(0, 2, 5);
        assert_eq!((ep.pool_idx, ep.set_idx, ep.disk_idx), (0, 2, 5));
    }
}

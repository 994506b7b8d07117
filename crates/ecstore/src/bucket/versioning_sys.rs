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
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersioningConfig {
    pub enabled: bool,
    pub suspended: bool,
    /// Prefixes excluded from versioning even when the bucket has it on.
    pub excluded_prefixes: Vec<String>,
}

impl VersioningConfig {
    pub fn prefix_enabled(&self, prefix: &str) -> bool {
        if !self.enabled {
            return false;
        }
        !self.excluded_prefixes.iter().any(|p| prefix.starts_with(p.as_str()))
    }

    pub fn prefix_suspended(&self, prefix: &str) -> bool {
        if self.suspended {
            return true;
        }
        self.enabled && self.excluded_prefixes.iter().any(|p| prefix.starts_with(p.as_str()))
    }
}

static VERSIONING_CONFIGS: OnceLock<RwLock<HashMap<String, VersioningConfig>>> = OnceLock::new();

fn configs() -> &'static RwLock<HashMap<String, VersioningConfig>> {
    VERSIONING_CONFIGS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Answers versioning questions per bucket/prefix for the whole process.
pub struct BucketVersioningSys;

impl BucketVersioningSys {
    pub async fn get(bucket: &str) -> VersioningConfig {
        configs().read().ok().and_then(|m| m.get(bucket).cloned()).unwrap_or_default()
    }

    pub async fn prefix_enabled(bucket: &str, prefix: &str) -> bool {
        Self::get(bucket).await.prefix_enabled(prefix)
    }

    pub async fn prefix_suspended(bucket: &str, prefix: &str) -> bool {
        Self::get(bucket).await.prefix_suspended(prefix)
    }

    pub fn set(bucket: &str, config: VersioningConfig) {
        if let Ok(mut m) = configs().write() {
            m.insert(bucket.to_string(), config);
        }
    }

    pub fn remove(bucket: &str) {
        if let Ok(mut m) = configs().write() {
            m.remove(bucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_rules() {
        BucketVersioningSys::set(
            "vtest",
            VersioningConfig {
                enabled: true,
                suspended: false,
                excluded_prefixes: vec!["tmp/".to_string()],
            },
        );

        assert!(BucketVersioningSys::prefix_enabled("vtest", "data/object").await);
        assert!(!BucketVersioningSys::prefix_enabled("vtest", "tmp/scratch").await);
        assert!(BucketVersioningSys::prefix_suspended("vtest", "tmp/scratch").await);
        assert!(!BucketVersioningSys::prefix_enabled("unknown", "x").await);
        BucketVersioningSys::remove("vtest");
    }
}

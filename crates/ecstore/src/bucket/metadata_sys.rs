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

//! Per-bucket metadata cache. The frontend loads and persists bucket
//! configuration; the core reads through this registry and replaces
//! entries atomically on invalidation.

use crate::bucket::replication::config::ReplicationConfiguration;
use crate::bucket::target::BucketTargets;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default)]
pub struct BucketMetadata {
    pub name: String,
    pub created: Option<OffsetDateTime>,
    pub replication_config: Option<ReplicationConfiguration>,
    pub replication_config_updated_at: Option<OffsetDateTime>,
    pub bucket_targets: Option<BucketTargets>,
}

static BUCKET_METADATA: OnceLock<RwLock<HashMap<String, BucketMetadata>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, BucketMetadata>> {
    BUCKET_METADATA.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn set_bucket_metadata(bucket: &str, meta: BucketMetadata) {
    if let Ok(mut m) = registry().write() {
        m.insert(bucket.to_string(), meta);
    }
}

pub fn set_replication_config(bucket: &str, config: Option<ReplicationConfiguration>) {
    if let Ok(mut m) = registry().write() {
        let entry = m.entry(bucket.to_string()).or_insert_with(|| BucketMetadata {
            name: bucket.to_string(),
            ..Default::default()
        });
        entry.replication_config = config;
        entry.replication_config_updated_at = Some(OffsetDateTime::now_utc());
    }
}

pub fn remove_bucket_metadata(bucket: &str) {
    if let Ok(mut m) = registry().write() {
        m.remove(bucket);
    }
}

pub fn get_bucket_metadata(bucket: &str) -> Option<BucketMetadata> {
    registry().read().ok().and_then(|m| m.get(bucket).cloned())
}

/// The bucket's replication configuration plus its last update time.
pub async fn get_replication_config(bucket: &str) -> Result<(ReplicationConfiguration, OffsetDateTime)> {
    let meta = get_bucket_metadata(bucket).ok_or(Error::ConfigNotFound)?;
    match meta.replication_config {
        Some(config) => Ok((config, meta.replication_config_updated_at.unwrap_or(OffsetDateTime::UNIX_EPOCH))),
        None => Err(Error::ConfigNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replication_config_lookup() {
        assert!(get_replication_config("missing-bucket").await.is_err());

        set_replication_config("mtest", Some(ReplicationConfiguration::default()));
        assert!(get_replication_config("mtest").await.is_ok());

        set_replication_config("mtest", None);
        assert!(get_replication_config("mtest").await.is_err());
        remove_bucket_metadata("mtest");
    }
}

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
use time::OffsetDateTime;

pub const REPLICATION_SERVICE: &str = "replication";

/// Amazon-style resource name addressing one replication target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ARN {
    pub arn_type: String,
    pub id: String,
    pub region: String,
    pub bucket: String,
}

impl ARN {
    pub fn parse(s: &str) -> Option<Self> {
        // arn:garnet:<type>:<region>:<id>:<bucket>
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[1] != "garnet" {
            return None;
        }
        Some(Self {
            arn_type: parts[2].to_string(),
            region: parts[3].to_string(),
            id: parts[4].to_string(),
            bucket: parts[5].to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.bucket.is_empty()
    }
}

impl fmt::Display for ARN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arn:garnet:{}:{}:{}:{}", self.arn_type, self.region, self.id, self.bucket)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// A configured remote peer for one bucket, as stored in bucket metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketTarget {
    pub source_bucket: String,
    /// Remote endpoint, `host[:port]`.
    pub endpoint: String,
    pub secure: bool,
    pub credentials: Option<Credentials>,
    pub target_bucket: String,
    pub arn: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub region: String,
    /// Push replication synchronously from the PUT path.
    pub replication_sync: bool,
    /// Opt out of active-active read proxying for this target.
    pub disable_proxy: bool,
    pub storage_class: String,
    pub reset_before_date: Option<OffsetDateTime>,
    pub reset_id: String,
}

impl BucketTarget {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.target_bucket.is_empty() && self.endpoint.is_empty() && self.arn.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketTargets {
    pub targets: Vec<BucketTarget>,
}

impl BucketTargets {
    pub fn is_empty(&self) -> bool {
        if self.targets.is_empty() {
            return true;
        }
        self.targets.iter().all(|t| t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arn_round_trip() {
        let arn = ARN {
            arn_type: REPLICATION_SERVICE.to_string(),
            region: String::new(),
            id: "cfg-id".to_string(),
            bucket: "dest".to_string(),
        };
        let s = arn.to_string();
        assert_eq!(s, "arn:garnet:replication::cfg-id:dest");
        assert_eq!(ARN::parse(&s).unwrap(), arn);
        assert!(ARN::parse("arn:aws:s3:::x").is_none());
    }
}

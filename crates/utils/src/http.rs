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

//! Header names that cross the boundary between the storage core and the
//! S3 frontend. Keys under the reserved prefix never leave the cluster.

pub const RESERVED_METADATA_PREFIX: &str = "X-Garnet-Internal-";
pub const RESERVED_METADATA_PREFIX_LOWER: &str = "x-garnet-internal-";

pub const AMZ_BUCKET_REPLICATION_STATUS: &str = "x-amz-bucket-replication-status";
pub const AMZ_OBJECT_TAGGING: &str = "x-amz-object-tagging";
pub const AMZ_STORAGE_CLASS: &str = "x-amz-storage-class";
pub const AMZ_TAGGING_DIRECTIVE: &str = "x-amz-tagging-directive";

pub const GARNET_SOURCE_ETAG: &str = "x-garnet-source-etag";
pub const GARNET_SOURCE_MTIME: &str = "x-garnet-source-mtime";
pub const GARNET_SOURCE_VERSION_ID: &str = "x-garnet-source-version-id";
pub const GARNET_REPLICATION_PROXY_REQUEST: &str = "x-garnet-replication-proxy-request";
pub const GARNET_REPLICATION_RESET_STATUS: &str = "x-garnet-replication-reset-status";
pub const GARNET_REPLICATION_ACTUAL_OBJECT_SIZE: &str = "x-garnet-replication-actual-object-size";
pub const GARNET_FORCE_DELETE: &str = "x-garnet-force-delete";

pub mod headers {
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_ENCODING: &str = "content-encoding";
    pub const CONTENT_LANGUAGE: &str = "content-language";
    pub const CONTENT_DISPOSITION: &str = "content-disposition";
    pub const CACHE_CONTROL: &str = "cache-control";
    pub const EXPIRES: &str = "expires";
    pub const ETAG: &str = "etag";

    pub const AMZ_OBJECT_LOCK_MODE: &str = "x-amz-object-lock-mode";
    pub const AMZ_OBJECT_LOCK_RETAIN_UNTIL_DATE: &str = "x-amz-object-lock-retain-until-date";
    pub const AMZ_OBJECT_LOCK_LEGAL_HOLD: &str = "x-amz-object-lock-legal-hold";
    pub const AMZ_WEBSITE_REDIRECT_LOCATION: &str = "x-amz-website-redirect-location";
    pub const AMZ_META_PREFIX: &str = "x-amz-meta-";
    pub const AMZ_TAG_COUNT: &str = "x-amz-tagging-count";

    pub use super::{
        AMZ_BUCKET_REPLICATION_STATUS, AMZ_OBJECT_TAGGING, AMZ_STORAGE_CLASS, RESERVED_METADATA_PREFIX,
        RESERVED_METADATA_PREFIX_LOWER,
    };
}

/// Case-insensitive lookup over a user metadata map.
pub trait MetadataLookup {
    fn lookup(&self, key: &str) -> Option<&String>;
}

impl MetadataLookup for std::collections::HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<&String> {
        if let Some(v) = self.get(key) {
            return Some(v);
        }
        self.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut m = HashMap::new();
        m.insert("Content-Type".to_string(), "text/plain".to_string());
        assert_eq!(m.lookup("content-type").map(|s| s.as_str()), Some("text/plain"));
        assert!(m.lookup("content-encoding").is_none());
    }
}

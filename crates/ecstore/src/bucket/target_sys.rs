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

//! Remote target registry. The wire client is abstract; whoever
//! configures a target supplies an implementation of `RemoteTargetApi`
//! and the replication engine only ever talks through `TargetClient`.

use crate::bucket::target::{BucketTarget, BucketTargets};
use crate::error::{Error, Result};
use bytes::Bytes;
use garnetfs_filemeta::ReplicationStatusType;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use time::OffsetDateTime;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tracing::warn;

/// Metadata of an object version as a remote peer reports it.
#[derive(Debug, Clone, Default)]
pub struct RemoteObjectInfo {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub size: i64,
    pub last_modified: Option<OffsetDateTime>,
    pub delete_marker: bool,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub user_tags: String,
    pub tag_count: i32,
    pub replication_status: ReplicationStatusType,
}

/// Internal knobs that ride along with replication writes so the
/// receiving side can keep source identity and ordering.
#[derive(Debug, Clone, Default)]
pub struct AdvancedPutOptions {
    pub source_version_id: String,
    pub source_etag: String,
    pub source_mtime: Option<OffsetDateTime>,
    pub replication_status: ReplicationStatusType,
    pub replication_request: bool,
    pub tagging_timestamp: Option<OffsetDateTime>,
    pub retention_timestamp: Option<OffsetDateTime>,
    pub legalhold_timestamp: Option<OffsetDateTime>,
    pub replication_validity_check: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectOptions {
    pub user_metadata: HashMap<String, String>,
    pub user_tags: HashMap<String, String>,
    pub content_type: String,
    pub content_encoding: String,
    pub content_language: String,
    pub content_disposition: String,
    pub cache_control: String,
    pub storage_class: String,
    pub website_redirect_location: String,
    pub internal: AdvancedPutOptions,
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectPartOptions {
    pub internal: AdvancedPutOptions,
}

#[derive(Debug, Clone, Default)]
pub struct CopyObjectOptions {
    pub user_metadata: HashMap<String, String>,
    pub user_tags: HashMap<String, String>,
    pub internal: AdvancedPutOptions,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveObjectOptions {
    pub force_delete: bool,
    pub replication_delete_marker: bool,
    pub replication_mtime: Option<OffsetDateTime>,
    pub replication_status: ReplicationStatusType,
    pub replication_request: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatObjectOptions {
    pub version_id: String,
    /// Marks the stat as a proxy probe so the peer will not proxy back.
    pub replication_proxy_request: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

pub type RemoteReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// The whole client contract one replication target must answer.
#[async_trait::async_trait]
pub trait RemoteTargetApi: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn head_object(&self, bucket: &str, object: &str, opts: &StatObjectOptions) -> Result<RemoteObjectInfo>;

    async fn get_object(&self, bucket: &str, object: &str, opts: &StatObjectOptions) -> Result<(RemoteObjectInfo, Bytes)>;

    async fn put_object(&self, bucket: &str, object: &str, size: i64, body: RemoteReader, opts: &PutObjectOptions)
    -> Result<RemoteObjectInfo>;

    /// Server-side copy onto itself, the metadata-only replication path.
    async fn copy_object(&self, bucket: &str, object: &str, version_id: Option<String>, opts: &CopyObjectOptions) -> Result<()>;

    async fn remove_object(&self, bucket: &str, object: &str, version_id: Option<String>, opts: &RemoveObjectOptions)
    -> Result<()>;

    async fn create_multipart_upload(&self, bucket: &str, object: &str, opts: &PutObjectOptions) -> Result<String>;

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number: i32,
        size: i64,
        body: Bytes,
        opts: &PutObjectPartOptions,
    ) -> Result<CompletedPart>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        opts: &PutObjectOptions,
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &str) -> Result<()>;
}

/// One registered target: its identity plus the wire client.
#[derive(Clone)]
pub struct TargetClient {
    pub arn: String,
    pub bucket: String,
    pub endpoint: String,
    pub secure: bool,
    pub storage_class: String,
    pub reset_id: String,
    pub replicate_sync: bool,
    pub disable_proxy: bool,
    pub reset_before_date: Option<OffsetDateTime>,
    pub api: Arc<dyn RemoteTargetApi>,
}

impl std::fmt::Debug for TargetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetClient")
            .field("arn", &self.arn)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl TargetClient {
    pub fn to_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }
}

#[derive(Default)]
struct TargetRegistry {
    /// bucket -> configured targets.
    targets: HashMap<String, BucketTargets>,
    /// bucket -> arn -> client.
    clients: HashMap<String, HashMap<String, Arc<TargetClient>>>,
    /// endpoint url -> offline flag.
    offline: HashMap<String, bool>,
}

/// Process-wide registry of remote replication targets with endpoint
/// health tracking.
pub struct BucketTargetSys {
    inner: RwLock<TargetRegistry>,
}

static GLOBAL_BUCKET_TARGET_SYS: OnceLock<BucketTargetSys> = OnceLock::new();

impl BucketTargetSys {
    pub fn get() -> &'static Self {
        GLOBAL_BUCKET_TARGET_SYS.get_or_init(|| Self {
            inner: RwLock::new(TargetRegistry::default()),
        })
    }

    /// Registers (or replaces) one target for a bucket together with its
    /// wire client.
    pub async fn set_target(&self, bucket: &str, target: &BucketTarget, api: Arc<dyn RemoteTargetApi>) -> Result<()> {
        if target.arn.is_empty() {
            return Err(Error::InvalidArgument("target arn is empty".to_string()));
        }

        let client = Arc::new(TargetClient {
            arn: target.arn.clone(),
            bucket: target.target_bucket.clone(),
            endpoint: target.endpoint.clone(),
            secure: target.secure,
            storage_class: target.storage_class.clone(),
            reset_id: target.reset_id.clone(),
            replicate_sync: target.replication_sync,
            disable_proxy: target.disable_proxy,
            reset_before_date: target.reset_before_date,
            api,
        });

        let mut inner = self.inner.write().await;
        let entry = inner.targets.entry(bucket.to_string()).or_default();
        entry.targets.retain(|t| t.arn != target.arn);
        entry.targets.push(target.clone());
        inner
            .clients
            .entry(bucket.to_string())
            .or_default()
            .insert(target.arn.clone(), client);
        Ok(())
    }

    pub async fn remove_target(&self, bucket: &str, arn: &str) {
        let mut inner = self.inner.write().await;
        if let Some(targets) = inner.targets.get_mut(bucket) {
            targets.targets.retain(|t| t.arn != arn);
        }
        if let Some(clients) = inner.clients.get_mut(bucket) {
            clients.remove(arn);
        }
    }

    pub async fn delete(&self, bucket: &str) {
        let mut inner = self.inner.write().await;
        inner.targets.remove(bucket);
        inner.clients.remove(bucket);
    }

    pub async fn list_bucket_targets(&self, bucket: &str) -> Result<BucketTargets> {
        let inner = self.inner.read().await;
        match inner.targets.get(bucket) {
            Some(targets) if !targets.is_empty() => Ok(targets.clone()),
            _ => Err(Error::RemoteTargetNotFound(bucket.to_string())),
        }
    }

    pub async fn get_remote_target_client(&self, bucket: &str, arn: &str) -> Option<Arc<TargetClient>> {
        let inner = self.inner.read().await;
        inner.clients.get(bucket).and_then(|m| m.get(arn)).cloned()
    }

    pub async fn get_remote_bucket_target_by_arn(&self, bucket: &str, arn: &str) -> Option<BucketTarget> {
        let inner = self.inner.read().await;
        inner
            .targets
            .get(bucket)
            .and_then(|targets| targets.targets.iter().find(|t| t.arn == arn).cloned())
    }

    pub async fn is_offline(&self, url: &str) -> bool {
        let inner = self.inner.read().await;
        inner.offline.get(url).copied().unwrap_or(false)
    }

    pub async fn mark_offline(&self, url: &str) {
        warn!("marking replication endpoint offline: {url}");
        let mut inner = self.inner.write().await;
        inner.offline.insert(url.to_string(), true);
    }

    pub async fn mark_online(&self, url: &str) {
        let mut inner = self.inner.write().await;
        inner.offline.insert(url.to_string(), false);
    }

    /// One health probe pass over every registered client. The frontend
    /// schedules this; tests call it directly.
    pub async fn heartbeat(&self) {
        let clients: Vec<Arc<TargetClient>> = {
            let inner = self.inner.read().await;
            inner.clients.values().flat_map(|m| m.values().cloned()).collect()
        };

        for client in clients {
            let healthy = client.api.bucket_exists(&client.bucket).await.unwrap_or(false);
            let url = client.to_url();
            if healthy {
                self.mark_online(&url).await;
            } else {
                self.mark_offline(&url).await;
            }
        }
    }
}

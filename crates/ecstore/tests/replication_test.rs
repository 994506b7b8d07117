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

//! Replication engine tests against an in-memory remote target: the
//! comparator's metadata-only path, delete replication against an
//! offline target, and the MRF retry after a target flap.

use bytes::Bytes;
use garnetfs_ecstore::bucket::metadata_sys;
use garnetfs_ecstore::bucket::replication::config::{
    DeleteMarkerReplication, DeleteReplication, Destination, ExistingObjectReplication, ReplicationConfiguration, Rule,
    RuleStatus,
};
use garnetfs_ecstore::bucket::replication::replicate::{
    DeletedObjectReplicationInfo, MustReplicateOptions, check_replicate_delete, must_replicate, replicate_delete,
    replicate_object,
};
use garnetfs_ecstore::bucket::replication::replication_pool::{
    ReplicationPoolOpts, init_background_replication,
};
use garnetfs_ecstore::bucket::replication::replication_resyncer::get_heal_replicate_object_info;
use garnetfs_ecstore::bucket::replication::{ReplicationConfig, schedule_replication};
use garnetfs_ecstore::bucket::target::BucketTarget;
use garnetfs_ecstore::bucket::target_sys::{
    BucketTargetSys, CompletedPart, CopyObjectOptions, PutObjectOptions, PutObjectPartOptions, RemoteObjectInfo, RemoteReader,
    RemoteTargetApi, RemoveObjectOptions, StatObjectOptions,
};
use garnetfs_ecstore::bucket::versioning_sys::{BucketVersioningSys, VersioningConfig};
use garnetfs_ecstore::error::{Error, Result};
use garnetfs_ecstore::store::ECStore;
use garnetfs_ecstore::store_api::{
    MakeBucketOptions, ObjectIO, ObjectOptions, ObjectToDelete, PutObjReader, StorageAPI,
};
use garnetfs_filemeta::{ReplicationStatusType, ReplicationType};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OnceCell};

#[derive(Debug, Default, Clone)]
struct StoredObject {
    body: Bytes,
    info: RemoteObjectInfo,
}

/// In-memory remote target that records every call.
#[derive(Default)]
struct MockTarget {
    objects: Mutex<HashMap<String, StoredObject>>,
    put_calls: AtomicUsize,
    copy_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    /// Fail this many PUTs before recovering.
    fail_puts: AtomicUsize,
}

impl MockTarget {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn seed(&self, object: &str, stored: StoredObject) {
        self.objects.lock().await.insert(object.to_string(), stored);
    }

    async fn has(&self, object: &str) -> bool {
        self.objects.lock().await.contains_key(object)
    }
}

#[async_trait::async_trait]
impl RemoteTargetApi for MockTarget {
    async fn bucket_exists(&self, _bucket: &str) -> Result<bool> {
        Ok(true)
    }

    async fn head_object(&self, _bucket: &str, object: &str, _opts: &StatObjectOptions) -> Result<RemoteObjectInfo> {
        match self.objects.lock().await.get(object) {
            Some(stored) => Ok(stored.info.clone()),
            None => Err(Error::ObjectNotFound("remote".to_string(), object.to_string())),
        }
    }

    async fn get_object(&self, _bucket: &str, object: &str, _opts: &StatObjectOptions) -> Result<(RemoteObjectInfo, Bytes)> {
        match self.objects.lock().await.get(object) {
            Some(stored) => Ok((stored.info.clone(), stored.body.clone())),
            None => Err(Error::ObjectNotFound("remote".to_string(), object.to_string())),
        }
    }

    async fn put_object(
        &self,
        _bucket: &str,
        object: &str,
        size: i64,
        mut body: RemoteReader,
        opts: &PutObjectOptions,
    ) -> Result<RemoteObjectInfo> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let failures_left = self.fail_puts.load(Ordering::SeqCst);
        if failures_left > 0 {
            self.fail_puts.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::other("remote returned 500"));
        }

        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.map_err(Error::from)?;

        let info = RemoteObjectInfo {
            etag: Some(opts.internal.source_etag.clone()),
            version_id: if opts.internal.source_version_id.is_empty() {
                None
            } else {
                Some(opts.internal.source_version_id.clone())
            },
            size,
            last_modified: opts.internal.source_mtime,
            metadata: opts.user_metadata.clone(),
            replication_status: ReplicationStatusType::Replica,
            ..Default::default()
        };
        self.objects.lock().await.insert(
            object.to_string(),
            StoredObject {
                body: Bytes::from(buf),
                info,
            },
        );
        Ok(self.objects.lock().await[object].info.clone())
    }

    async fn copy_object(&self, _bucket: &str, object: &str, _version_id: Option<String>, opts: &CopyObjectOptions) -> Result<()> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().await;
        let Some(stored) = objects.get_mut(object) else {
            return Err(Error::ObjectNotFound("remote".to_string(), object.to_string()));
        };
        stored.info.metadata = opts.user_metadata.clone();
        Ok(())
    }

    async fn remove_object(
        &self,
        _bucket: &str,
        object: &str,
        _version_id: Option<String>,
        _opts: &RemoveObjectOptions,
    ) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().await.remove(object);
        Ok(())
    }

    async fn create_multipart_upload(&self, _bucket: &str, _object: &str, _opts: &PutObjectOptions) -> Result<String> {
        Ok("mock-upload".to_string())
    }

    async fn put_object_part(
        &self,
        _bucket: &str,
        _object: &str,
        _upload_id: &str,
        part_number: i32,
        _size: i64,
        body: Bytes,
        _opts: &PutObjectPartOptions,
    ) -> Result<CompletedPart> {
        use md5::Digest as _;
        let digest = hex::encode(md5::Md5::digest(&body));
        Ok(CompletedPart {
            part_number,
            etag: digest,
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        object: &str,
        _upload_id: &str,
        _parts: Vec<CompletedPart>,
        _opts: &PutObjectOptions,
    ) -> Result<()> {
        self.objects.lock().await.insert(object.to_string(), StoredObject::default());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _object: &str, _upload_id: &str) -> Result<()> {
        Ok(())
    }
}

const SET_DRIVES: usize = 4;
const PARITY: usize = 2;

struct Env {
    store: Arc<ECStore>,
    _dirs: Vec<tempfile::TempDir>,
}

static ENV: OnceCell<Env> = OnceCell::const_new();

async fn env() -> &'static Env {
    ENV.get_or_init(|| async {
        let dirs: Vec<tempfile::TempDir> = (0..SET_DRIVES).map(|_| tempfile::tempdir().unwrap()).collect();
        let paths: Vec<String> = dirs.iter().map(|d| d.path().to_string_lossy().to_string()).collect();
        let store = ECStore::from_local_paths(paths, 1, SET_DRIVES, PARITY).await.unwrap();

        garnetfs_ecstore::global::set_object_layer(store.clone());
        init_background_replication(store.clone(), ReplicationPoolOpts::default()).await;

        Env { store, _dirs: dirs }
    })
    .await
}

fn replication_rule(arn: &str) -> Rule {
    Rule {
        id: format!("rule-{arn}"),
        status: RuleStatus::Enabled,
        priority: 1,
        destination: Destination {
            bucket: arn.to_string(),
            storage_class: String::new(),
        },
        delete_marker_replication: DeleteMarkerReplication { status: RuleStatus::Enabled },
        delete_replication: DeleteReplication { status: RuleStatus::Enabled },
        existing_object_replication: ExistingObjectReplication { status: RuleStatus::Enabled },
        ..Default::default()
    }
}

/// Wires a bucket with versioning, a replication config and one mock
/// target; returns the target handle.
async fn setup_replicated_bucket(bucket: &str, arn: &str, endpoint: &str) -> Arc<MockTarget> {
    let store = &env().await.store;
    store.make_bucket(bucket, &MakeBucketOptions::default()).await.unwrap();

    BucketVersioningSys::set(
        bucket,
        VersioningConfig {
            enabled: true,
            ..Default::default()
        },
    );

    metadata_sys::set_replication_config(
        bucket,
        Some(ReplicationConfiguration {
            role: String::new(),
            rules: vec![replication_rule(arn)],
        }),
    );

    let mock = MockTarget::new();
    BucketTargetSys::get()
        .set_target(
            bucket,
            &BucketTarget {
                source_bucket: bucket.to_string(),
                endpoint: endpoint.to_string(),
                target_bucket: "remote-bucket".to_string(),
                arn: arn.to_string(),
                ..Default::default()
            },
            mock.clone(),
        )
        .await
        .unwrap();

    mock
}

async fn put_versioned(bucket: &str, object: &str, body: Vec<u8>) -> garnetfs_ecstore::store_api::ObjectInfo {
    let store = &env().await.store;
    let mut reader = PutObjReader::from_vec(body);
    store
        .put_object(
            bucket,
            object,
            &mut reader,
            &ObjectOptions {
                versioned: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_must_replicate_decisions() {
    let _mock = setup_replicated_bucket("dec-bucket", "arn:garnet:replication::t1:remote", "t1.example.local").await;

    let oi = put_versioned("dec-bucket", "obj", vec![1, 2, 3]).await;

    let dsc = must_replicate(
        "dec-bucket",
        "obj",
        MustReplicateOptions::from_object_info(&oi, ReplicationType::Object, &ObjectOptions::default()),
    )
    .await;
    assert!(dsc.replicate_any());

    // A replica never re-replicates.
    let mut replica = oi.clone();
    replica
        .user_defined
        .insert("x-amz-bucket-replication-status".to_string(), "REPLICA".to_string());
    let dsc = must_replicate(
        "dec-bucket",
        "obj",
        MustReplicateOptions::from_object_info(&replica, ReplicationType::Object, &ObjectOptions::default()),
    )
    .await;
    assert!(!dsc.replicate_any());

    // A request marked as replication push never re-replicates.
    let dsc = must_replicate(
        "dec-bucket",
        "obj",
        MustReplicateOptions::from_object_info(
            &oi,
            ReplicationType::Object,
            &ObjectOptions {
                replication_request: true,
                ..Default::default()
            },
        ),
    )
    .await;
    assert!(!dsc.replicate_any());

    // Already completed: the decision set is empty.
    let mut completed = oi.clone();
    completed
        .user_defined
        .insert("x-amz-bucket-replication-status".to_string(), "COMPLETED".to_string());
    let dsc = must_replicate(
        "dec-bucket",
        "obj",
        MustReplicateOptions::from_object_info(&completed, ReplicationType::Object, &ObjectOptions::default()),
    )
    .await;
    assert!(!dsc.replicate_any());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replicate_full_then_noop() {
    let arn = "arn:garnet:replication::t2:remote";
    let mock = setup_replicated_bucket("sync-bucket", arn, "t2.example.local").await;
    let store = env().await.store.clone();

    let body = vec![7u8; 128 * 1024];
    let oi = put_versioned("sync-bucket", "widget", body.clone()).await;

    let dsc = must_replicate(
        "sync-bucket",
        "widget",
        MustReplicateOptions::from_object_info(&oi, ReplicationType::Object, &ObjectOptions::default()),
    )
    .await;
    assert!(dsc.replicate_any());

    // First pass uploads the content.
    let roi = build_roi(&oi, dsc.clone()).await;
    replicate_object(roi, store.clone()).await;
    assert_eq!(mock.put_calls.load(Ordering::SeqCst), 1);
    assert!(mock.has("widget").await);

    let updated = store
        .get_object_info(
            "sync-bucket",
            "widget",
            &ObjectOptions {
                versioned: true,
                version_id: oi.version_id.map(|v| v.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.target_replication_status(arn), ReplicationStatusType::Completed);

    // Duplicate work items degrade to no-ops: the comparator sees the
    // target in sync and no further upload happens.
    for _ in 0..3 {
        let roi = build_roi(&updated, dsc.clone()).await;
        replicate_object(roi, store.clone()).await;
    }
    assert_eq!(mock.put_calls.load(Ordering::SeqCst), 1, "no network PUT for in-sync duplicates");
}

async fn build_roi(
    oi: &garnetfs_ecstore::store_api::ObjectInfo,
    dsc: garnetfs_filemeta::ReplicateDecision,
) -> garnetfs_ecstore::bucket::replication::replicate::ReplicateObjectInfo {
    let mut rstate = oi.replication_state();
    rstate.replicate_decision_str = dsc.to_string();
    garnetfs_ecstore::bucket::replication::replicate::ReplicateObjectInfo {
        name: oi.name.clone(),
        size: oi.size,
        actual_size: oi.actual_size,
        bucket: oi.bucket.clone(),
        version_id: oi.version_id,
        etag: oi.etag.clone(),
        mod_time: oi.mod_time,
        replication_status: oi.replication_status.clone(),
        replication_status_internal: oi.replication_status_internal.clone(),
        version_purge_status_internal: oi.version_purge_status_internal.clone(),
        version_purge_status: oi.version_purge_status.clone(),
        replication_state: Some(rstate),
        op_type: ReplicationType::Object,
        dsc,
        user_tags: oi.user_tags.clone(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_only_drift_issues_copy() {
    let arn = "arn:garnet:replication::t3:remote";
    let mock = setup_replicated_bucket("meta-bucket", arn, "t3.example.local").await;
    let store = env().await.store.clone();

    let body = vec![3u8; 64 * 1024];
    let oi = put_versioned("meta-bucket", "tagged", body.clone()).await;

    // Target already has identical content but different user metadata.
    mock.seed(
        "tagged",
        StoredObject {
            body: Bytes::from(body),
            info: RemoteObjectInfo {
                etag: oi.etag.clone(),
                version_id: oi.version_id.map(|v| v.to_string()),
                size: oi.size,
                last_modified: oi.mod_time,
                metadata: HashMap::from([("x-amz-meta-team".to_string(), "old".to_string())]),
                ..Default::default()
            },
        },
    )
    .await;

    // Local carries drifted whitelisted metadata.
    let mut drifted = oi.clone();
    drifted
        .user_defined
        .insert("x-amz-meta-team".to_string(), "new".to_string());

    let dsc = must_replicate(
        "meta-bucket",
        "tagged",
        MustReplicateOptions::from_object_info(&oi, ReplicationType::Metadata, &ObjectOptions::default()),
    )
    .await;

    // Update the stored metadata locally so the replication read sees it.
    store
        .put_object_metadata(
            "meta-bucket",
            "tagged",
            &ObjectOptions {
                version_id: oi.version_id.map(|v| v.to_string()),
                eval_metadata: Some(HashMap::from([("x-amz-meta-team".to_string(), "new".to_string())])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let roi = build_roi(&drifted, dsc).await;
    replicate_object(roi, store.clone()).await;

    assert_eq!(mock.copy_calls.load(Ordering::SeqCst), 1, "metadata drift must use CopyObject");
    assert_eq!(mock.put_calls.load(Ordering::SeqCst), 0, "metadata drift must not re-upload content");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_marker_replication_offline_target() {
    let arn = "arn:garnet:replication::t4:remote";
    let mock = setup_replicated_bucket("del-bucket", arn, "t4.example.local").await;
    let store = env().await.store.clone();

    let oi = put_versioned("del-bucket", "doomed", vec![9u8; 1024]).await;
    let _ = oi;

    // Take the target down before the delete.
    BucketTargetSys::get().mark_offline("http://t4.example.local").await;

    // The frontend's delete path: decide, stamp, delete, enqueue.
    let current = store
        .get_object_info(
            "del-bucket",
            "doomed",
            &ObjectOptions {
                versioned: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let dsc = check_replicate_delete(
        "del-bucket",
        &ObjectToDelete {
            object_name: "doomed".to_string(),
            ..Default::default()
        },
        &current,
        &ObjectOptions {
            versioned: true,
            ..Default::default()
        },
        None,
    )
    .await;
    assert!(dsc.replicate_any(), "offline target still gets the delete queued");

    let mut del_opts = ObjectOptions {
        versioned: true,
        ..Default::default()
    };
    del_opts.set_delete_replication_state(dsc.clone());

    let deleted = store.delete_object("del-bucket", "doomed", del_opts).await.unwrap();
    assert!(deleted.delete_marker);
    let marker_version = deleted.version_id.unwrap();

    let dobj = DeletedObjectReplicationInfo {
        delete_object: garnetfs_ecstore::store_api::DeletedObject {
            object_name: "doomed".to_string(),
            delete_marker: true,
            delete_marker_version_id: Some(marker_version),
            delete_marker_mtime: deleted.mod_time,
            replication_state: {
                let mut rs = garnetfs_filemeta::ReplicationState::default();
                rs.replicate_decision_str = dsc.to_string();
                Some(rs)
            },
            ..Default::default()
        },
        bucket: "del-bucket".to_string(),
        op_type: ReplicationType::Delete,
        ..Default::default()
    };

    replicate_delete(dobj, store.clone()).await;

    // No remote call went out, and the marker metadata records Failed.
    assert_eq!(mock.remove_calls.load(Ordering::SeqCst), 0);

    let marker = store
        .get_object_info(
            "del-bucket",
            "doomed",
            &ObjectOptions {
                versioned: true,
                version_id: Some(marker_version.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(marker.target_replication_status(arn), ReplicationStatusType::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mrf_requeue_after_target_flap() {
    let arn = "arn:garnet:replication::t5:remote";
    let mock = setup_replicated_bucket("mrf-bucket", arn, "t5.example.local").await;
    let store = env().await.store.clone();

    // First PUT fails, the retry succeeds.
    mock.fail_puts.store(1, Ordering::SeqCst);

    let oi = put_versioned("mrf-bucket", "flappy", vec![5u8; 32 * 1024]).await;
    let dsc = must_replicate(
        "mrf-bucket",
        "flappy",
        MustReplicateOptions::from_object_info(&oi, ReplicationType::Object, &ObjectOptions::default()),
    )
    .await;

    schedule_replication(oi.clone(), store.clone(), dsc, ReplicationType::Object).await;

    // Wait for the first failure plus the MRF retry to complete.
    let mut completed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = store
            .get_object_info(
                "mrf-bucket",
                "flappy",
                &ObjectOptions {
                    versioned: true,
                    version_id: oi.version_id.map(|v| v.to_string()),
                    no_lock: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        if current.target_replication_status(arn) == ReplicationStatusType::Completed {
            completed = true;
            break;
        }
    }

    assert!(completed, "MRF retry must converge to Completed");
    assert_eq!(mock.put_calls.load(Ordering::SeqCst), 2, "exactly one retry, no third attempt");
    assert!(mock.has("flappy").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heal_candidate_requalifies_pending() {
    let arn = "arn:garnet:replication::t6:remote";
    let _mock = setup_replicated_bucket("heal-bucket", arn, "t6.example.local").await;
    let store = env().await.store.clone();

    let oi = put_versioned("heal-bucket", "laggard", vec![2u8; 4 * 1024]).await;

    let targets = BucketTargetSys::get().list_bucket_targets("heal-bucket").await.unwrap();
    let (cfg, _) = metadata_sys::get_replication_config("heal-bucket").await.unwrap();
    let rcfg = ReplicationConfig::new(Some(cfg), Some(targets));

    let roi = get_heal_replicate_object_info(&oi, &rcfg).await;
    assert!(roi.existing_obj_resync.must_resync(), "unreplicated version must requalify");
    assert!(roi.dsc.replicate_any());
    let _ = store;
}

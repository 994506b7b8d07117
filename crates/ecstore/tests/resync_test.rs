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

//! Existing-object resync: walking the bucket, checkpoint resume after a
//! restart, and the persisted resync.bin state machine.

use bytes::Bytes;
use garnetfs_ecstore::bucket::metadata_sys;
use garnetfs_ecstore::bucket::replication::config::{
    DeleteMarkerReplication, DeleteReplication, Destination, ExistingObjectReplication, ReplicationConfiguration, Rule,
    RuleStatus,
};
use garnetfs_ecstore::bucket::replication::replication_pool::{ReplicationPoolOpts, init_background_replication};
use garnetfs_ecstore::bucket::replication::replication_resyncer::{
    BucketReplicationResyncStatus, ReplicationResyncer, ResyncOpts, ResyncStatusType, TargetReplicationResyncStatus,
    load_bucket_resync_metadata, save_resync_status,
};
use garnetfs_ecstore::bucket::target::BucketTarget;
use garnetfs_ecstore::bucket::target_sys::{
    BucketTargetSys, CompletedPart, CopyObjectOptions, PutObjectOptions, PutObjectPartOptions, RemoteObjectInfo, RemoteReader,
    RemoteTargetApi, RemoveObjectOptions, StatObjectOptions,
};
use garnetfs_ecstore::bucket::versioning_sys::{BucketVersioningSys, VersioningConfig};
use garnetfs_ecstore::error::{Error, Result};
use garnetfs_ecstore::store::ECStore;
use garnetfs_ecstore::store_api::{MakeBucketOptions, ObjectIO, ObjectOptions, PutObjReader, StorageAPI};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingTarget {
    objects: Mutex<HashMap<String, Bytes>>,
    put_order: Mutex<Vec<String>>,
    put_calls: AtomicUsize,
}

#[async_trait::async_trait]
impl RemoteTargetApi for RecordingTarget {
    async fn bucket_exists(&self, _bucket: &str) -> Result<bool> {
        Ok(true)
    }

    async fn head_object(&self, _bucket: &str, object: &str, _opts: &StatObjectOptions) -> Result<RemoteObjectInfo> {
        match self.objects.lock().await.get(object) {
            Some(body) => Ok(RemoteObjectInfo {
                size: body.len() as i64,
                ..Default::default()
            }),
            None => Err(Error::ObjectNotFound("remote".to_string(), object.to_string())),
        }
    }

    async fn get_object(&self, bucket: &str, object: &str, opts: &StatObjectOptions) -> Result<(RemoteObjectInfo, Bytes)> {
        let info = self.head_object(bucket, object, opts).await?;
        let body = self.objects.lock().await.get(object).cloned().unwrap_or_default();
        Ok((info, body))
    }

    async fn put_object(
        &self,
        _bucket: &str,
        object: &str,
        _size: i64,
        mut body: RemoteReader,
        _opts: &PutObjectOptions,
    ) -> Result<RemoteObjectInfo> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.map_err(Error::from)?;
        self.objects.lock().await.insert(object.to_string(), Bytes::from(buf));
        self.put_order.lock().await.push(object.to_string());
        Ok(RemoteObjectInfo::default())
    }

    async fn copy_object(&self, _bucket: &str, _object: &str, _version_id: Option<String>, _opts: &CopyObjectOptions) -> Result<()> {
        Ok(())
    }

    async fn remove_object(
        &self,
        _bucket: &str,
        object: &str,
        _version_id: Option<String>,
        _opts: &RemoveObjectOptions,
    ) -> Result<()> {
        self.objects.lock().await.remove(object);
        Ok(())
    }

    async fn create_multipart_upload(&self, _bucket: &str, _object: &str, _opts: &PutObjectOptions) -> Result<String> {
        Ok("upload".to_string())
    }

    async fn put_object_part(
        &self,
        _bucket: &str,
        _object: &str,
        _upload_id: &str,
        part_number: i32,
        _size: i64,
        _body: Bytes,
        _opts: &PutObjectPartOptions,
    ) -> Result<CompletedPart> {
        Ok(CompletedPart {
            part_number,
            etag: "etag".to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _object: &str,
        _upload_id: &str,
        _parts: Vec<CompletedPart>,
        _opts: &PutObjectOptions,
    ) -> Result<()> {
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

async fn setup_bucket(bucket: &str, arn: &str, endpoint: &str, reset_id: &str) -> Arc<RecordingTarget> {
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
            rules: vec![Rule {
                id: "resync-rule".to_string(),
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
            }],
        }),
    );

    let target = Arc::new(RecordingTarget::default());
    BucketTargetSys::get()
        .set_target(
            bucket,
            &BucketTarget {
                source_bucket: bucket.to_string(),
                endpoint: endpoint.to_string(),
                target_bucket: "remote".to_string(),
                arn: arn.to_string(),
                reset_id: reset_id.to_string(),
                ..Default::default()
            },
            target.clone(),
        )
        .await
        .unwrap();

    target
}

async fn put_objects(bucket: &str, names: &[&str]) {
    let store = &env().await.store;
    for name in names {
        let mut reader = PutObjReader::from_vec(format!("payload-{name}").into_bytes());
        store
            .put_object(
                bucket,
                name,
                &mut reader,
                &ObjectOptions {
                    versioned: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_walks_ascending_and_completes() {
    let arn = "arn:garnet:replication::r1:remote";
    let target = setup_bucket("resync-full", arn, "r1.example.local", "").await;
    let store = env().await.store.clone();

    put_objects("resync-full", &["obj-003", "obj-001", "obj-002"]).await;

    let resyncer = Arc::new(ReplicationResyncer::new());
    let opts = ResyncOpts {
        bucket: "resync-full".to_string(),
        arn: arn.to_string(),
        resync_id: "resync-a".to_string(),
        resync_before: None,
    };

    resyncer
        .clone()
        .resync_bucket(CancellationToken::new(), store.clone(), false, opts.clone())
        .await;

    // All three objects land on the target. Ordering across distinct
    // objects is not guaranteed (workers run in parallel), membership is.
    let mut order = target.put_order.lock().await.clone();
    order.sort();
    assert_eq!(order, vec!["obj-001", "obj-002", "obj-003"]);

    let status_map = resyncer.status_map.read().await;
    let state = &status_map["resync-full"].targets_map[arn];
    assert_eq!(state.resync_status, ResyncStatusType::ResyncCompleted);
    assert_eq!(state.replicated_count, 3);

    // The state file is persisted and decodable.
    let loaded = load_bucket_resync_metadata("resync-full", store.clone()).await.unwrap();
    assert_eq!(loaded.targets_map[arn].resync_status, ResyncStatusType::ResyncCompleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_resumes_after_checkpoint() {
    let arn = "arn:garnet:replication::r2:remote";
    let target = setup_bucket("resync-resume", arn, "r2.example.local", "").await;
    let store = env().await.store.clone();

    put_objects(
        "resync-resume",
        &["obj-001", "obj-002", "obj-003", "obj-004", "obj-005"],
    )
    .await;

    // Simulate a crashed pass that checkpointed after obj-002.
    let mut persisted = BucketReplicationResyncStatus::new();
    persisted.targets_map.insert(
        arn.to_string(),
        TargetReplicationResyncStatus {
            resync_id: "resync-b".to_string(),
            resync_status: ResyncStatusType::ResyncStarted,
            object: "obj-002".to_string(),
            bucket: "resync-resume".to_string(),
            replicated_count: 2,
            ..Default::default()
        },
    );
    save_resync_status("resync-resume", &persisted, store.clone()).await.unwrap();

    // Relaunch: load the persisted state and resume.
    let resyncer = Arc::new(ReplicationResyncer::new());
    resyncer
        .clone()
        .load_resync(CancellationToken::new(), store.clone(), &["resync-resume".to_string()])
        .await
        .unwrap();

    // Wait for the resumed walk to finish.
    let mut completed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status_map = resyncer.status_map.read().await;
        if let Some(state) = status_map.get("resync-resume").and_then(|s| s.targets_map.get(arn)) {
            if state.resync_status == ResyncStatusType::ResyncCompleted {
                completed = true;
                break;
            }
        }
    }
    assert!(completed, "resumed resync must reach Completed");

    // Only the objects after the checkpoint were pushed.
    let mut order = target.put_order.lock().await.clone();
    order.sort();
    assert_eq!(order, vec!["obj-003", "obj-004", "obj-005"]);

    let status_map = resyncer.status_map.read().await;
    let state = &status_map["resync-resume"].targets_map[arn];
    assert_eq!(state.replicated_count, 2 + 3, "counters accumulate across the resume");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_refuses_duplicate_resync() {
    let arn = "arn:garnet:replication::r3:remote";
    let _target = setup_bucket("resync-dup", arn, "r3.example.local", "").await;
    let store = env().await.store.clone();

    let resyncer = Arc::new(ReplicationResyncer::new());
    {
        let mut status_map = resyncer.status_map.write().await;
        let mut bucket_status = BucketReplicationResyncStatus::new();
        bucket_status.targets_map.insert(
            arn.to_string(),
            TargetReplicationResyncStatus {
                resync_status: ResyncStatusType::ResyncStarted,
                ..Default::default()
            },
        );
        status_map.insert("resync-dup".to_string(), bucket_status);
    }

    let err = resyncer
        .clone()
        .start(
            CancellationToken::new(),
            store.clone(),
            ResyncOpts {
                bucket: "resync-dup".to_string(),
                arn: arn.to_string(),
                resync_id: "dup".to_string(),
                resync_before: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already in progress"));

    // An unknown ARN is refused outright.
    let err = resyncer
        .start(
            CancellationToken::new(),
            store.clone(),
            ResyncOpts {
                bucket: "resync-dup".to_string(),
                arn: "arn:garnet:replication::missing:remote".to_string(),
                resync_id: "x".to_string(),
                resync_before: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing in the replication config"));
}

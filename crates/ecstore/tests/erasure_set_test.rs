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

//! End-to-end storage engine tests over real local drives in temp
//! directories: quorum writes surviving drive loss, healing, and the
//! multipart state machine.

use garnetfs_ecstore::store::ECStore;
use garnetfs_ecstore::store_api::{
    CompletePart, HTTPRangeSpec, HealOpts, MakeBucketOptions, ObjectIO, ObjectOptions, PutObjReader, StorageAPI,
};
use md5::{Digest as _, Md5};
use std::sync::Arc;

const SET_DRIVES: usize = 6;
const PARITY: usize = 2;

struct TestCluster {
    dirs: Vec<tempfile::TempDir>,
    store: Arc<ECStore>,
}

async fn new_cluster() -> TestCluster {
    let dirs: Vec<tempfile::TempDir> = (0..SET_DRIVES).map(|_| tempfile::tempdir().unwrap()).collect();
    let paths: Vec<String> = dirs.iter().map(|d| d.path().to_string_lossy().to_string()).collect();
    let store = ECStore::from_local_paths(paths, 1, SET_DRIVES, PARITY).await.unwrap();
    TestCluster { dirs, store }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_read_round_trip() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("bucket", &MakeBucketOptions::default()).await.unwrap();

    let body = payload(2 * 1024 * 1024 + 123);
    let mut reader = PutObjReader::from_vec(body.clone());
    let oi = store
        .put_object("bucket", "dir/object", &mut reader, &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(oi.size, body.len() as i64);

    let mut hasher = Md5::new();
    hasher.update(&body);
    assert_eq!(oi.etag.as_deref(), Some(hex::encode(hasher.finalize()).as_str()));

    let mut gr = store
        .get_object_reader("bucket", "dir/object", None, http::HeaderMap::new(), &ObjectOptions::default())
        .await
        .unwrap();
    let got = gr.read_all().await.unwrap();
    assert_eq!(got, body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_read() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("bucket", &MakeBucketOptions::default()).await.unwrap();

    let body = payload(3 * 1024 * 1024);
    let mut reader = PutObjReader::from_vec(body.clone());
    store
        .put_object("bucket", "ranged", &mut reader, &ObjectOptions::default())
        .await
        .unwrap();

    let mut gr = store
        .get_object_reader(
            "bucket",
            "ranged",
            Some(HTTPRangeSpec::new(1_000_000, 1_999_999)),
            http::HeaderMap::new(),
            &ObjectOptions::default(),
        )
        .await
        .unwrap();
    let got = gr.read_all().await.unwrap();
    assert_eq!(got, &body[1_000_000..2_000_000]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quorum_read_survives_drive_loss_and_heal_restores() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("bucket", &MakeBucketOptions::default()).await.unwrap();

    let body = payload(5 * 1024 * 1024);
    let mut reader = PutObjReader::from_vec(body.clone());
    store
        .put_object("bucket", "resilient", &mut reader, &ObjectOptions::default())
        .await
        .unwrap();

    // Lose the object on `parity` drives before reading.
    let mut lost = 0;
    for dir in cluster.dirs.iter() {
        let object_dir = dir.path().join("bucket").join("resilient");
        if object_dir.exists() && lost < PARITY {
            std::fs::remove_dir_all(&object_dir).unwrap();
            lost += 1;
        }
    }
    assert_eq!(lost, PARITY);

    let mut gr = store
        .get_object_reader("bucket", "resilient", None, http::HeaderMap::new(), &ObjectOptions::default())
        .await
        .unwrap();
    let got = gr.read_all().await.unwrap();
    assert_eq!(got, body, "decoded bytes must match after losing {PARITY} drives");

    // Healing restores metadata and shards on the lost drives.
    store
        .heal_object("bucket", "resilient", "", &HealOpts::default())
        .await
        .unwrap();

    let mut with_meta = 0;
    for dir in cluster.dirs.iter() {
        if dir.path().join("bucket").join("resilient").join("xl.meta").exists() {
            with_meta += 1;
        }
    }
    assert_eq!(with_meta, SET_DRIVES, "xl.meta must be back on every drive after heal");

    // And the object still reads clean.
    let mut gr = store
        .get_object_reader("bucket", "resilient", None, http::HeaderMap::new(), &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(gr.read_all().await.unwrap(), body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multipart_out_of_order_assembly() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("b", &MakeBucketOptions::default()).await.unwrap();

    let part_size = 5 * 1024 * 1024;
    let part_body = vec![b'a'; part_size];

    let upload = store
        .new_multipart_upload("b", "o", &ObjectOptions::default())
        .await
        .unwrap();

    // Parts arrive out of order.
    let mut reader2 = PutObjReader::from_vec(part_body.clone());
    let part2 = store
        .put_object_part("b", "o", &upload.upload_id, 2, &mut reader2, &ObjectOptions::default())
        .await
        .unwrap();
    let mut reader1 = PutObjReader::from_vec(part_body.clone());
    let part1 = store
        .put_object_part("b", "o", &upload.upload_id, 1, &mut reader1, &ObjectOptions::default())
        .await
        .unwrap();

    let oi = store
        .clone()
        .complete_multipart_upload(
            "b",
            "o",
            &upload.upload_id,
            vec![
                CompletePart {
                    part_num: 1,
                    etag: part1.etag.clone(),
                },
                CompletePart {
                    part_num: 2,
                    etag: part2.etag.clone(),
                },
            ],
            &ObjectOptions::default(),
        )
        .await
        .unwrap();

    // ETag is md5(md5(part1) || md5(part2)) with a part-count suffix.
    let part_digest = Md5::digest(&part_body);
    let mut combined = Vec::new();
    combined.extend_from_slice(&part_digest);
    combined.extend_from_slice(&part_digest);
    let want_etag = format!("{}-2", hex::encode(Md5::digest(&combined)));
    assert_eq!(oi.etag.as_deref(), Some(want_etag.as_str()));
    assert_eq!(oi.size, (2 * part_size) as i64);

    let mut gr = store
        .get_object_reader("b", "o", None, http::HeaderMap::new(), &ObjectOptions::default())
        .await
        .unwrap();
    let got = gr.read_all().await.unwrap();
    assert_eq!(got.len(), 2 * part_size);
    assert!(got.iter().all(|&b| b == b'a'));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_complete_rejects_wrong_etag_and_small_part() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("b", &MakeBucketOptions::default()).await.unwrap();

    let upload = store
        .new_multipart_upload("b", "bad", &ObjectOptions::default())
        .await
        .unwrap();

    let mut small = PutObjReader::from_vec(vec![b'x'; 1024]);
    let small_part = store
        .put_object_part("b", "bad", &upload.upload_id, 1, &mut small, &ObjectOptions::default())
        .await
        .unwrap();
    let mut tail = PutObjReader::from_vec(vec![b'y'; 1024]);
    let tail_part = store
        .put_object_part("b", "bad", &upload.upload_id, 2, &mut tail, &ObjectOptions::default())
        .await
        .unwrap();

    // A non-final part under 5MiB is rejected.
    let err = store
        .clone()
        .complete_multipart_upload(
            "b",
            "bad",
            &upload.upload_id,
            vec![
                CompletePart {
                    part_num: 1,
                    etag: small_part.etag.clone(),
                },
                CompletePart {
                    part_num: 2,
                    etag: tail_part.etag.clone(),
                },
            ],
            &ObjectOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, garnetfs_ecstore::Error::EntityTooSmall(1, _, _)));

    // A mismatched ETag is rejected.
    let err = store
        .clone()
        .complete_multipart_upload(
            "b",
            "bad",
            &upload.upload_id,
            vec![CompletePart {
                part_num: 2,
                etag: Some("deadbeefdeadbeefdeadbeefdeadbeef".to_string()),
            }],
            &ObjectOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, garnetfs_ecstore::Error::InvalidPart(2, _, _)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_removes_upload() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("b", &MakeBucketOptions::default()).await.unwrap();

    let upload = store
        .new_multipart_upload("b", "gone", &ObjectOptions::default())
        .await
        .unwrap();

    let listed = store
        .list_multipart_uploads("b", "gone", None, None, 100)
        .await
        .unwrap();
    assert_eq!(listed.uploads.len(), 1);

    store
        .abort_multipart_upload("b", "gone", &upload.upload_id, &ObjectOptions::default())
        .await
        .unwrap();

    let listed = store
        .list_multipart_uploads("b", "gone", None, None, 100)
        .await
        .unwrap();
    assert!(listed.uploads.is_empty(), "aborted uploadID must be absent from listings");

    let err = store
        .abort_multipart_upload("b", "gone", &upload.upload_id, &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, garnetfs_ecstore::Error::InvalidUploadId(_, _, _)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_versioned_delete_inserts_marker() {
    let cluster = new_cluster().await;
    let store = cluster.store.clone();

    store.make_bucket("vb", &MakeBucketOptions::default()).await.unwrap();

    let body = payload(64 * 1024);
    let mut reader = PutObjReader::from_vec(body.clone());
    let put_opts = ObjectOptions {
        versioned: true,
        ..Default::default()
    };
    let oi = store.put_object("vb", "versioned", &mut reader, &put_opts).await.unwrap();
    let put_version = oi.version_id.unwrap();

    let deleted = store
        .delete_object(
            "vb",
            "versioned",
            ObjectOptions {
                versioned: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(deleted.delete_marker);
    let marker_version = deleted.version_id.unwrap();
    assert_ne!(marker_version, put_version);

    // Plain GET sees the delete marker as not-found.
    let err = store
        .get_object_reader("vb", "versioned", None, http::HeaderMap::new(), &ObjectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, garnetfs_ecstore::Error::ObjectNotFound(_, _)));

    // The shadowed version still reads.
    let mut gr = store
        .get_object_reader(
            "vb",
            "versioned",
            None,
            http::HeaderMap::new(),
            &ObjectOptions {
                versioned: true,
                version_id: Some(put_version.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(gr.read_all().await.unwrap(), body);
}

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

//! Server pools: the composition of one or more `Sets`. New objects land
//! in the pool with the most free space; once written, an object's pool
//! is part of its identity and all later operations route to it.

use crate::disk::format::FormatV3;
use crate::disk::{DiskAPI as _, DiskInfoOptions, DiskOption, DiskStore, endpoint::Endpoint, new_disk};
use crate::error::{Error, Result, is_err_bucket_not_found, is_err_object_not_found, is_err_version_not_found};
use crate::sets::Sets;
use crate::store_api::{
    BucketInfo, BucketOptions, CompletePart, DeleteBucketOptions, DeletedObject, GetObjectReader, HTTPRangeSpec, HealOpts,
    HealResultItem, ListMultipartsInfo, ListPartsInfo, MakeBucketOptions, MultipartUploadResult, ObjectIO, ObjectInfo,
    ObjectInfoOrErr, ObjectOptions, ObjectToDelete, PartInfo, PutObjReader, StorageAPI, StorageInfo, WalkOptions,
};
use garnetfs_lock::{LocalClient, LocalLockMap, LockClient, NamespaceLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// How often the stale multipart sweeper runs.
const STALE_UPLOAD_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug)]
pub struct ECStore {
    pub pools: Vec<Arc<Sets>>,
    pub deployment_id: Uuid,
}

impl ECStore {
    pub fn new(pools: Vec<Arc<Sets>>) -> Result<Arc<Self>> {
        if pools.is_empty() {
            return Err(Error::InvalidArgument("at least one pool is required".to_string()));
        }
        let deployment_id = pools[0].id;
        Ok(Arc::new(Self { pools, deployment_id }))
    }

    /// Builds a single-pool store over local mounts, formatting fresh
    /// drives. Drive count must be `num_sets * set_drive_count`.
    pub async fn from_local_paths(
        paths: Vec<String>,
        num_sets: usize,
        set_drive_count: usize,
        parity: usize,
    ) -> Result<Arc<Self>> {
        if paths.len() != num_sets * set_drive_count {
            return Err(Error::InvalidArgument(format!(
                "got {} drives for a {}x{} layout",
                paths.len(),
                num_sets,
                set_drive_count
            )));
        }

        let format = FormatV3::new(num_sets, set_drive_count);

        let mut disks: Vec<Option<DiskStore>> = Vec::with_capacity(paths.len());
        let mut endpoints = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let mut ep = Endpoint::new_local(path);
            ep.set_location(0, i / set_drive_count, i % set_drive_count);
            let disk = new_disk(&ep, &DiskOption::default()).await?;

            // Stamp the drive with its identity from the fresh format.
            let mut drive_format = format.clone();
            drive_format.erasure.this = format.erasure.sets[i / set_drive_count][i % set_drive_count];
            disk.write_all(
                crate::disk::GARNET_META_BUCKET,
                crate::disk::FORMAT_CONFIG_FILE,
                drive_format.marshal()?,
            )
            .await?;
            disk.set_disk_id(Some(drive_format.erasure.this)).await?;

            endpoints.push(ep);
            disks.push(Some(disk));
        }

        // One shared local lock table stands in for the peer lock
        // servers on a single node.
        let lockers: Vec<Arc<dyn LockClient>> = vec![LocalClient::new(LocalLockMap::new())];

        let sets = Sets::new(
            crate::global::global_local_node_name(),
            disks,
            endpoints,
            format,
            0,
            parity,
            lockers,
        )
        .await?;

        crate::global::set_global_deployment_id(sets.id);

        Self::new(vec![sets])
    }

    /// Pool that already owns this object, if any.
    async fn get_pool_idx_existing(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<usize> {
        if self.pools.len() == 1 {
            return Ok(0);
        }

        let mut lookup_opts = opts.clone();
        lookup_opts.no_lock = true;
        for (idx, pool) in self.pools.iter().enumerate() {
            match pool.get_object_info(bucket, object, &lookup_opts).await {
                Ok(_) => return Ok(idx),
                Err(err) if is_err_object_not_found(&err) || is_err_version_not_found(&err) => continue,
                Err(err) if is_err_bucket_not_found(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::ObjectNotFound(bucket.to_string(), object.to_string()))
    }

    /// Pool for a fresh write: the existing owner when there is one,
    /// otherwise the pool with the most free space.
    async fn get_pool_idx(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<usize> {
        if self.pools.len() == 1 {
            return Ok(0);
        }

        if let Ok(idx) = self.get_pool_idx_existing(bucket, object, opts).await {
            return Ok(idx);
        }

        let mut best = 0usize;
        let mut best_free = 0u64;
        for (idx, pool) in self.pools.iter().enumerate() {
            let info = pool.storage_info().await;
            let free: u64 = info.disks.iter().map(|d| d.free).sum();
            if free > best_free {
                best_free = free;
                best = idx;
            }
        }
        Ok(best)
    }

    /// Spawns the long-running maintenance loops: stale-upload sweeping
    /// per pool and the resync checkpointer.
    pub async fn start_background_tasks(self: Arc<Self>, cancel: CancellationToken) {
        for pool in self.pools.iter() {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.cleanup_stale_uploads_loop(cancel, STALE_UPLOAD_CLEANUP_INTERVAL).await;
            });
        }

        if let Some(pool) = crate::bucket::replication::global_replication_pool() {
            let resyncer = pool.resyncer_handle();
            let store = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                resyncer.persist_to_disk(cancel, store).await;
            });
        }

        info!("storage background tasks started");
    }
}

#[async_trait::async_trait]
impl ObjectIO for ECStore {
    async fn get_object_reader(
        &self,
        bucket: &str,
        object: &str,
        range: Option<HTTPRangeSpec>,
        h: http::HeaderMap,
        opts: &ObjectOptions,
    ) -> Result<GetObjectReader> {
        let idx = self.get_pool_idx_existing(bucket, object, opts).await?;
        self.pools[idx].get_object_reader(bucket, object, range, h, opts).await
    }

    async fn put_object(&self, bucket: &str, object: &str, data: &mut PutObjReader, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let idx = self.get_pool_idx(bucket, object, opts).await?;
        self.pools[idx].put_object(bucket, object, data, opts).await
    }
}

#[async_trait::async_trait]
impl StorageAPI for ECStore {
    async fn new_ns_lock(&self, bucket: &str, object: &str) -> Result<NamespaceLock> {
        self.pools[0].new_ns_lock(bucket, object).await
    }

    async fn storage_info(&self) -> StorageInfo {
        let mut info = StorageInfo::default();
        for pool in self.pools.iter() {
            let pool_info = pool.storage_info().await;
            info.online_disks += pool_info.online_disks;
            info.offline_disks += pool_info.offline_disks;
            info.disks.extend(pool_info.disks);
        }
        info
    }

    async fn local_storage_info(&self) -> StorageInfo {
        self.storage_info().await
    }

    async fn make_bucket(&self, bucket: &str, opts: &MakeBucketOptions) -> Result<()> {
        for pool in self.pools.iter() {
            pool.make_bucket(bucket, opts).await?;
        }
        Ok(())
    }

    async fn get_bucket_info(&self, bucket: &str, opts: &BucketOptions) -> Result<BucketInfo> {
        self.pools[0].get_bucket_info(bucket, opts).await
    }

    async fn list_bucket(&self, opts: &BucketOptions) -> Result<Vec<BucketInfo>> {
        self.pools[0].list_bucket(opts).await
    }

    async fn delete_bucket(&self, bucket: &str, opts: &DeleteBucketOptions) -> Result<()> {
        for pool in self.pools.iter() {
            pool.delete_bucket(bucket, opts).await?;
        }
        Ok(())
    }

    async fn get_object_info(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let idx = self.get_pool_idx_existing(bucket, object, opts).await?;
        self.pools[idx].get_object_info(bucket, object, opts).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        src_info: &mut ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        let src_idx = self.get_pool_idx_existing(src_bucket, src_object, src_opts).await?;
        self.pools[src_idx]
            .copy_object(src_bucket, src_object, dst_bucket, dst_object, src_info, src_opts, dst_opts)
            .await
    }

    async fn delete_object(&self, bucket: &str, object: &str, opts: ObjectOptions) -> Result<ObjectInfo> {
        let idx = match self.get_pool_idx_existing(bucket, object, &opts).await {
            Ok(idx) => idx,
            // Deleting a missing object may still need to record a
            // delete marker in a versioned bucket.
            Err(err) if is_err_object_not_found(&err) && (opts.versioned || opts.version_suspended) => 0,
            Err(err) => return Err(err),
        };
        self.pools[idx].delete_object(bucket, object, opts).await
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectToDelete>,
        opts: ObjectOptions,
    ) -> Result<(Vec<DeletedObject>, Vec<Option<Error>>)> {
        let mut deleted = Vec::with_capacity(objects.len());
        let mut errors = Vec::with_capacity(objects.len());
        for dobj in objects {
            let idx = self
                .get_pool_idx_existing(bucket, &dobj.object_name, &opts)
                .await
                .unwrap_or(0);
            let (mut d, mut e) = self.pools[idx].delete_objects(bucket, vec![dobj], opts.clone()).await?;
            deleted.append(&mut d);
            errors.append(&mut e);
        }
        Ok((deleted, errors))
    }

    async fn put_object_metadata(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let idx = self.get_pool_idx_existing(bucket, object, opts).await?;
        self.pools[idx].put_object_metadata(bucket, object, opts).await
    }

    async fn new_multipart_upload(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<MultipartUploadResult> {
        let idx = self.get_pool_idx(bucket, object, opts).await?;
        self.pools[idx].new_multipart_upload(bucket, object, opts).await
    }

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_id: usize,
        data: &mut PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<PartInfo> {
        for (idx, pool) in self.pools.iter().enumerate() {
            match pool.put_object_part(bucket, object, upload_id, part_id, data, opts).await {
                Err(Error::InvalidUploadId(_, _, _)) if idx + 1 < self.pools.len() => continue,
                other => return other,
            }
        }
        Err(Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()))
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: usize,
        max_parts: usize,
        opts: &ObjectOptions,
    ) -> Result<ListPartsInfo> {
        for (idx, pool) in self.pools.iter().enumerate() {
            match pool
                .list_object_parts(bucket, object, upload_id, part_number_marker, max_parts, opts)
                .await
            {
                Err(Error::InvalidUploadId(_, _, _)) if idx + 1 < self.pools.len() => continue,
                other => return other,
            }
        }
        Err(Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()))
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo> {
        let mut result = ListMultipartsInfo {
            prefix: prefix.to_string(),
            max_uploads,
            ..Default::default()
        };
        for pool in self.pools.iter() {
            let pool_result = pool
                .list_multipart_uploads(bucket, prefix, key_marker.clone(), upload_id_marker.clone(), max_uploads)
                .await?;
            result.uploads.extend(pool_result.uploads);
        }
        Ok(result)
    }

    async fn complete_multipart_upload(
        self: Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        uploaded_parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        for (idx, pool) in self.pools.iter().enumerate() {
            match pool
                .clone()
                .complete_multipart_upload(bucket, object, upload_id, uploaded_parts.clone(), opts)
                .await
            {
                Err(Error::InvalidUploadId(_, _, _)) if idx + 1 < self.pools.len() => continue,
                other => return other,
            }
        }
        Err(Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()))
    }

    async fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &str, opts: &ObjectOptions) -> Result<()> {
        for (idx, pool) in self.pools.iter().enumerate() {
            match pool.abort_multipart_upload(bucket, object, upload_id, opts).await {
                Err(Error::InvalidUploadId(_, _, _)) if idx + 1 < self.pools.len() => continue,
                other => return other,
            }
        }
        Err(Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()))
    }

    async fn walk(
        &self,
        cancel: CancellationToken,
        bucket: &str,
        prefix: &str,
        tx: Sender<ObjectInfoOrErr>,
        opts: WalkOptions,
    ) -> Result<()> {
        if self.pools.len() == 1 {
            return self.pools[0].walk(cancel, bucket, prefix, tx, opts).await;
        }

        // Merge the per-pool walks in ascending name order, mirroring the
        // per-set merge one level down.
        let mut pool_rxs = Vec::with_capacity(self.pools.len());
        for pool in self.pools.iter() {
            let (pool_tx, pool_rx) = tokio::sync::mpsc::channel::<ObjectInfoOrErr>(64);
            pool.walk(cancel.clone(), bucket, prefix, pool_tx, opts.clone()).await?;
            pool_rxs.push(pool_rx);
        }

        tokio::spawn(async move {
            let mut heads: Vec<Option<ObjectInfoOrErr>> = Vec::with_capacity(pool_rxs.len());
            for rx in pool_rxs.iter_mut() {
                heads.push(rx.recv().await);
            }

            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let mut min_idx: Option<usize> = None;
                for (i, head) in heads.iter().enumerate() {
                    let Some(head) = head else { continue };
                    if head.err.is_some() {
                        min_idx = Some(i);
                        break;
                    }
                    let Some(item) = &head.item else { continue };
                    match min_idx {
                        Some(j) => {
                            if let Some(current) = heads[j].as_ref().and_then(|h| h.item.as_ref()) {
                                if (item.name.as_str(), item.mod_time) < (current.name.as_str(), current.mod_time) {
                                    min_idx = Some(i);
                                }
                            }
                        }
                        None => min_idx = Some(i),
                    }
                }

                let Some(idx) = min_idx else { return };
                let item = heads[idx].take().unwrap();
                if tx.send(item).await.is_err() {
                    return;
                }
                heads[idx] = pool_rxs[idx].recv().await;
            }
        });

        Ok(())
    }

    async fn add_partial(&self, bucket: &str, object: &str, version_id: &str) -> Result<()> {
        self.pools[0].add_partial(bucket, object, version_id).await
    }

    async fn heal_bucket(&self, bucket: &str, opts: &HealOpts) -> Result<()> {
        for pool in self.pools.iter() {
            pool.heal_bucket(bucket, opts).await?;
        }
        Ok(())
    }

    async fn heal_object(&self, bucket: &str, object: &str, version_id: &str, opts: &HealOpts) -> Result<HealResultItem> {
        let idx = self.get_pool_idx_existing(bucket, object, &ObjectOptions::default()).await?;
        self.pools[idx].heal_object(bucket, object, version_id, opts).await
    }

    async fn get_disks(&self, pool_idx: usize, set_idx: usize) -> Result<Vec<Option<DiskStore>>> {
        if pool_idx >= self.pools.len() {
            return Err(Error::InvalidArgument(format!("pool index {pool_idx} out of range")));
        }
        self.pools[pool_idx].get_disks(pool_idx, set_idx).await
    }
}

impl ECStore {
    /// Aggregate free capacity, consulted by callers sizing uploads.
    pub async fn total_free_capacity(&self) -> u64 {
        let mut free = 0u64;
        for pool in self.pools.iter() {
            for set in pool.disk_set.iter() {
                for disk in set.get_disks_internal().await.iter().flatten() {
                    if let Ok(info) = disk.disk_info(&DiskInfoOptions::default()).await {
                        free += info.free;
                    }
                }
            }
        }
        free
    }
}

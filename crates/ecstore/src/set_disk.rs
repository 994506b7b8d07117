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

//! One erasure set: a fixed group of drives holding objects erasure-coded
//! with a data/parity split. Every operation fans out per drive, reduces
//! the per-drive errors by quorum and only surfaces the verdict.

use crate::config::storageclass::StorageClassConfig;
use crate::disk::error::DiskError;
use crate::disk::error_reduce::{
    BUCKET_OP_IGNORED_ERRS, OBJECT_OP_IGNORED_ERRS, reduce_read_quorum_errs, reduce_write_quorum_errs,
};
use crate::disk::format::FormatV3;
use crate::disk::{
    DeleteOptions, DiskAPI as _, DiskInfoOptions, DiskStore, GARNET_META_TMP_BUCKET, ReadOptions, STORAGE_FORMAT_FILE,
    UpdateMetadataOpts, WalkDirOptions, endpoint::Endpoint,
};
use crate::erasure_coding::{BitrotReader, BitrotWriterWrapper, Erasure};
use crate::error::{Error, Result, to_object_err};
use crate::store_api::{
    BucketInfo, BucketOptions, DeleteBucketOptions, DeletedObject, GetObjectReader, HTTPRangeSpec, HealOpts, HealResultItem,
    MakeBucketOptions, ObjectIO, ObjectInfo, ObjectInfoOrErr, ObjectOptions, ObjectToDelete, PutObjReader, StorageAPI,
    StorageInfo, WalkOptions,
};
use garnetfs_filemeta::{
    FileInfo, FileMeta, ReplicationState, replication_statuses_map, version_purge_statuses_map,
};
use garnetfs_lock::{LockClient, NamespaceLock};
use garnetfs_utils::HashAlgorithm;
use garnetfs_utils::http::RESERVED_METADATA_PREFIX_LOWER;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

mod heal;
mod multipart;

pub use heal::{HealEntry, drain_heal_entries, queue_heal_entry};
pub use multipart::{GLOBAL_MIN_PART_SIZE, STALE_UPLOAD_EXPIRY};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Overall budget for one namespace lock acquisition.
pub fn get_lock_acquire_timeout() -> Duration {
    Duration::from_secs(
        std::env::var("GARNETFS_LOCK_ACQUIRE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30),
    )
}

#[derive(Debug, Clone)]
pub struct SetDisks {
    pub locker_owner: String,
    pub disks: Arc<RwLock<Vec<Option<DiskStore>>>>,
    pub set_endpoints: Vec<Endpoint>,
    pub set_drive_count: usize,
    pub default_parity_count: usize,
    pub set_index: usize,
    pub pool_index: usize,
    pub format: FormatV3,
    pub lockers: Vec<Arc<dyn LockClient>>,
    pub storage_class: StorageClassConfig,
}

impl SetDisks {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        locker_owner: String,
        disks: Arc<RwLock<Vec<Option<DiskStore>>>>,
        set_drive_count: usize,
        default_parity_count: usize,
        set_index: usize,
        pool_index: usize,
        set_endpoints: Vec<Endpoint>,
        format: FormatV3,
        lockers: Vec<Arc<dyn LockClient>>,
    ) -> Arc<Self> {
        Arc::new(SetDisks {
            locker_owner,
            disks,
            set_drive_count,
            default_parity_count,
            set_index,
            pool_index,
            set_endpoints,
            format,
            lockers,
            storage_class: StorageClassConfig::default(),
        })
    }

    pub async fn get_disks_internal(&self) -> Vec<Option<DiskStore>> {
        self.disks.read().await.clone()
    }

    pub fn default_write_quorum(&self) -> usize {
        let data = self.set_drive_count - self.default_parity_count;
        if data == self.default_parity_count { data + 1 } else { data }
    }

    pub fn default_read_quorum(&self) -> usize {
        self.set_drive_count - self.default_parity_count
    }

    /// Reorders drives by the object's distribution permutation so parity
    /// positions rotate across objects.
    pub fn shuffle_disks(disks: &[Option<DiskStore>], distribution: &[usize]) -> Vec<Option<DiskStore>> {
        if distribution.is_empty() {
            return disks.to_vec();
        }
        let mut shuffled: Vec<Option<DiskStore>> = vec![None; disks.len()];
        for (index, disk) in disks.iter().enumerate() {
            let block_index = distribution[index];
            shuffled[block_index - 1] = disk.clone();
        }
        shuffled
    }

    /// Shuffles drives together with per-drive metadata, stamping each
    /// copy's erasure index.
    pub fn shuffle_disks_and_parts_metadata(
        disks: &[Option<DiskStore>],
        parts_metadata: &[FileInfo],
        fi: &FileInfo,
    ) -> (Vec<Option<DiskStore>>, Vec<FileInfo>) {
        let distribution = &fi.erasure.distribution;
        let mut shuffled_disks: Vec<Option<DiskStore>> = vec![None; disks.len()];
        let mut shuffled_metadata: Vec<FileInfo> = vec![FileInfo::default(); disks.len()];

        for (index, disk) in disks.iter().enumerate() {
            let block_index = distribution[index];
            shuffled_disks[block_index - 1] = disk.clone();
            let mut meta = parts_metadata[index].clone();
            meta.erasure.index = block_index;
            shuffled_metadata[block_index - 1] = meta;
        }

        (shuffled_disks, shuffled_metadata)
    }

    /// Reads every drive's view of one version.
    pub async fn read_all_fileinfo(
        disks: &[Option<DiskStore>],
        bucket: &str,
        object: &str,
        version_id: &str,
        read_data: bool,
    ) -> (Vec<Option<FileInfo>>, Vec<Option<DiskError>>) {
        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            let version_id = version_id.to_string();
            futures.push(async move {
                match disk {
                    Some(disk) => {
                        disk.read_version(
                            "",
                            bucket,
                            object,
                            &version_id,
                            &ReadOptions {
                                read_data,
                                healing: false,
                            },
                        )
                        .await
                    }
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut metas = Vec::with_capacity(disks.len());
        let mut errors = Vec::with_capacity(disks.len());
        for result in join_all(futures).await {
            match result {
                Ok(fi) => {
                    metas.push(Some(fi));
                    errors.push(None);
                }
                Err(err) => {
                    metas.push(None);
                    errors.push(Some(err));
                }
            }
        }
        (metas, errors)
    }

    /// Picks the authoritative version: the highest modTime carried by at
    /// least `quorum` drives.
    pub fn find_file_info_in_quorum(
        metas: &[Option<FileInfo>],
        quorum: usize,
    ) -> Result<(FileInfo, Vec<bool>)> {
        let mut counts: HashMap<Option<OffsetDateTime>, usize> = HashMap::new();
        for meta in metas.iter().flatten() {
            *counts.entry(meta.mod_time).or_insert(0) += 1;
        }

        let mut candidates: Vec<(Option<OffsetDateTime>, usize)> =
            counts.into_iter().filter(|(_, count)| *count >= quorum).collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let Some((mod_time, _)) = candidates.first() else {
            return Err(Error::ErasureReadQuorum);
        };

        let mut latest = None;
        let mut online = vec![false; metas.len()];
        for (i, meta) in metas.iter().enumerate() {
            if let Some(meta) = meta {
                if meta.mod_time == *mod_time {
                    online[i] = true;
                    if latest.is_none() {
                        latest = Some(meta.clone());
                    }
                }
            }
        }

        let fi = latest.ok_or(Error::ErasureReadQuorum)?;
        Ok((fi, online))
    }

    /// Resolves the requested version from every drive under read quorum.
    /// Returns the winning FileInfo, all per-drive copies and the drives
    /// that carry the winning version.
    pub async fn get_object_fileinfo(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
        read_data: bool,
    ) -> Result<(FileInfo, Vec<Option<FileInfo>>, Vec<Option<DiskStore>>)> {
        let disks = self.get_disks_internal().await;
        let version_id = opts.version_id.clone().unwrap_or_default();

        let (metas, errors) = Self::read_all_fileinfo(&disks, bucket, object, &version_id, read_data).await;

        let read_quorum = self.default_read_quorum();
        if let Some(err) = reduce_read_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, read_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        let (fi, online) = Self::find_file_info_in_quorum(&metas, fi_read_quorum(&metas, read_quorum))?;

        let online_disks = disks
            .iter()
            .zip(online.iter())
            .map(|(disk, ok)| if *ok { disk.clone() } else { None })
            .collect();

        Ok((fi, metas, online_disks))
    }

    /// Writes distinct per-drive metadata copies; fails the operation
    /// when fewer than `write_quorum` drives accept.
    pub async fn write_unique_file_info(
        disks: &[Option<DiskStore>],
        org_bucket: &str,
        bucket: &str,
        prefix: &str,
        files: &[FileInfo],
        write_quorum: usize,
    ) -> std::result::Result<(), DiskError> {
        let mut futures = Vec::with_capacity(disks.len());
        for (i, disk) in disks.iter().enumerate() {
            let fi = files.get(i).cloned();
            futures.push(async move {
                match (disk, fi) {
                    (Some(disk), Some(mut fi)) if fi.is_valid() || fi.deleted => {
                        fi.mod_time = fi.mod_time.or(Some(OffsetDateTime::now_utc()));
                        disk.write_metadata(org_bucket, bucket, prefix, fi).await
                    }
                    _ => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(disks.len());
        for result in join_all(futures).await {
            errors.push(result.err());
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            return Err(err);
        }
        Ok(())
    }

    /// Commits staged data: renames every drive's staging dir into its
    /// final object path and rewrites xl.meta, under write quorum.
    pub async fn rename_data(
        disks: &[Option<DiskStore>],
        src_bucket: &str,
        src_path: &str,
        parts_metadata: &[FileInfo],
        dst_bucket: &str,
        dst_object: &str,
        write_quorum: usize,
    ) -> Result<(Vec<Option<DiskStore>>, Option<Uuid>)> {
        let mut futures = Vec::with_capacity(disks.len());
        for (i, disk) in disks.iter().enumerate() {
            let fi = parts_metadata.get(i).cloned();
            futures.push(async move {
                match (disk, fi) {
                    (Some(disk), Some(fi)) => disk.rename_data(src_bucket, src_path, fi, dst_bucket, dst_object).await,
                    _ => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(disks.len());
        let mut old_data_dir = None;
        let mut online: Vec<Option<DiskStore>> = Vec::with_capacity(disks.len());
        for (i, result) in join_all(futures).await.into_iter().enumerate() {
            match result {
                Ok(resp) => {
                    if old_data_dir.is_none() {
                        old_data_dir = resp.old_data_dir;
                    }
                    online.push(disks[i].clone());
                    errors.push(None);
                }
                Err(err) => {
                    online.push(None);
                    errors.push(Some(err));
                }
            }
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            // Undo the rename on the drives that succeeded so no drive is
            // left with a version the set never committed.
            for (i, disk) in disks.iter().enumerate() {
                if errors[i].is_none() {
                    if let Some(disk) = disk {
                        if let Some(fi) = parts_metadata.get(i) {
                            let _ = disk
                                .delete_version(dst_bucket, dst_object, fi.clone(), false, DeleteOptions::default())
                                .await;
                        }
                    }
                }
            }
            return Err(to_object_err(err.into(), vec![dst_bucket, dst_object]));
        }

        Ok((online, old_data_dir))
    }

    /// Removes the data dir an overwrite displaced.
    pub async fn commit_rename_data_dir(
        &self,
        disks: &[Option<DiskStore>],
        bucket: &str,
        object: &str,
        old_data_dir: &Uuid,
        _write_quorum: usize,
    ) {
        let path = format!("{object}/{old_data_dir}");
        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter().flatten() {
            let path = path.clone();
            futures.push(async move {
                disk.delete(
                    bucket,
                    &path,
                    DeleteOptions {
                        recursive: true,
                        ..Default::default()
                    },
                )
                .await
            });
        }
        for result in join_all(futures).await {
            if let Err(err) = result {
                warn!("failed to remove displaced data dir {}/{}: {}", bucket, path, err);
            }
        }
    }

    /// Deletes a path on every drive, used for staging and upload areas.
    pub async fn delete_all(&self, bucket: &str, prefix: &str) -> Result<()> {
        let disks = self.get_disks_internal().await;
        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter().flatten() {
            futures.push(async move {
                disk.delete(
                    bucket,
                    prefix,
                    DeleteOptions {
                        recursive: true,
                        ..Default::default()
                    },
                )
                .await
            });
        }
        join_all(futures).await;
        Ok(())
    }

    fn parity_for(&self, opts: &ObjectOptions, user_defined: &HashMap<String, String>, disk_count: usize) -> usize {
        if opts.max_parity {
            return disk_count / 2;
        }
        let sc = user_defined
            .get(garnetfs_utils::http::AMZ_STORAGE_CLASS)
            .cloned()
            .unwrap_or_default();
        self.storage_class.get_parity_for_sc(&sc).unwrap_or(self.default_parity_count)
    }

    /// Streams an object (or range of it) through the decoder into the
    /// writer, reconstructing from parity as drives fail. `disks` and
    /// `shard_data` are in shard-position order (already shuffled by the
    /// object's distribution); `shard_data` carries inline shards from
    /// each drive's xl.meta.
    #[allow(clippy::too_many_arguments)]
    pub async fn read_object_stream<W>(
        fi: &FileInfo,
        disks: &[Option<DiskStore>],
        shard_data: &[Option<bytes::Bytes>],
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        writer: &mut W,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin + Send,
    {
        let erasure = Erasure::new(fi.erasure.data_blocks, fi.erasure.parity_blocks, fi.erasure.block_size);
        let algo = fi.erasure.get_checksum_info(1).algorithm;

        let (mut part_index, mut part_offset) = fi.to_part_offset(offset as usize)?;
        let mut remaining = length;

        while remaining > 0 {
            let Some(part) = fi.parts.get(part_index) else {
                return Err(Error::other("insufficient parts for requested range"));
            };

            let till = ((part.size - part_offset) as u64).min(remaining);

            // Position every shard reader at the stripe covering the part
            // offset; the decoder walks stripes from there.
            let start_block = part_offset / fi.erasure.block_size;
            let shard_size = erasure.shard_size();
            let frame = algo.size() + shard_size;
            let reader_offset = start_block * frame;

            let mut readers: Vec<Option<BitrotReader>> = Vec::with_capacity(disks.len());
            for (i, disk) in disks.iter().enumerate() {
                // Inline objects carry each drive's shard in its own
                // xl.meta copy.
                if let Some(data) = shard_data.get(i).and_then(|d| d.as_ref()) {
                    let mut cursor = std::io::Cursor::new(data.to_vec());
                    cursor.set_position(reader_offset as u64);
                    readers.push(Some(BitrotReader::new(Box::new(cursor), shard_size, algo.clone())));
                    continue;
                }

                match disk {
                    Some(disk) => {
                        let part_path = format!(
                            "{object}/{}/part.{}",
                            fi.data_dir.map(|d| d.to_string()).unwrap_or_default(),
                            part.number
                        );
                        let file_size = crate::erasure_coding::bitrot_shard_file_size(
                            erasure.shard_file_size(part.size as i64) as usize,
                            shard_size,
                            &algo,
                        );
                        match disk
                            .read_file_stream(bucket, &part_path, reader_offset, file_size.saturating_sub(reader_offset))
                            .await
                        {
                            Ok(stream) => readers.push(Some(BitrotReader::new(stream, shard_size, algo.clone()))),
                            Err(err) => {
                                warn!("failed to open shard on {}: {}", disk.to_string(), err);
                                readers.push(None);
                            }
                        }
                    }
                    None => readers.push(None),
                }
            }

            erasure
                .decode_stream(writer, &mut readers, part_offset as u64, till, part.size as u64)
                .await
                .map_err(|e| to_object_err(e.into(), vec![bucket, object]))?;

            remaining -= till;
            part_index += 1;
            part_offset = 0;
        }

        Ok(())
    }

    /// Erasure-encodes a payload into a staging directory, returning the
    /// writers (for inline capture) and bytes written.
    pub async fn encode_to_tmp(
        &self,
        disks: &[Option<DiskStore>],
        erasure: &Erasure,
        tmp_path: &str,
        data: &mut PutObjReader,
        inline: bool,
        write_quorum: usize,
    ) -> Result<(Vec<Option<BitrotWriterWrapper>>, u64)> {
        let mut writers: Vec<Option<BitrotWriterWrapper>> = Vec::with_capacity(disks.len());
        let mut errors: Vec<Option<DiskError>> = Vec::with_capacity(disks.len());

        for disk in disks.iter() {
            match disk {
                Some(disk) if disk.is_online().await => {
                    if inline {
                        writers.push(Some(BitrotWriterWrapper::new_inline(HashAlgorithm::HighwayHash256)));
                        errors.push(None);
                        continue;
                    }
                    match disk.create_file("", GARNET_META_TMP_BUCKET, tmp_path, 0).await {
                        Ok(file) => {
                            writers.push(Some(BitrotWriterWrapper::new_stream(file, HashAlgorithm::HighwayHash256)));
                            errors.push(None);
                        }
                        Err(err) => {
                            warn!("failed to stage shard file on {}: {}", disk.to_string(), err);
                            writers.push(None);
                            errors.push(Some(err));
                        }
                    }
                }
                _ => {
                    writers.push(None);
                    errors.push(Some(DiskError::DiskNotFound));
                }
            }
        }

        let online = errors.iter().filter(|e| e.is_none()).count();
        if online < write_quorum {
            if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
                return Err(err.into());
            }
            return Err(Error::ErasureWriteQuorum);
        }

        let data_size = data.size();
        let written = erasure
            .encode_stream(&mut data.stream, &mut writers, data_size, write_quorum)
            .await?;

        Ok((writers, written))
    }
}

/// Read quorum derived from the metadata itself when present (delete
/// markers have no erasure descriptor and fall back to the set default).
fn fi_read_quorum(metas: &[Option<FileInfo>], default_quorum: usize) -> usize {
    for meta in metas.iter().flatten() {
        if !meta.deleted && meta.erasure.data_blocks > 0 {
            return meta.erasure.data_blocks;
        }
    }
    default_quorum
}

#[async_trait::async_trait]
impl ObjectIO for SetDisks {
    #[tracing::instrument(level = "debug", skip(self, h))]
    async fn get_object_reader(
        &self,
        bucket: &str,
        object: &str,
        range: Option<HTTPRangeSpec>,
        h: http::HeaderMap,
        opts: &ObjectOptions,
    ) -> Result<GetObjectReader> {
        // Shared read lock for read consistency; replication passes
        // no_lock because it already holds its own keyspace lock.
        let read_lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_read_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let (fi, metas, disks) = self
            .get_object_fileinfo(bucket, object, opts, true)
            .await
            .map_err(|err| to_object_err(err, vec![bucket, object]))?;

        let object_info = ObjectInfo::from_file_info(&fi, bucket, object, opts.versioned || opts.version_suspended);

        if object_info.delete_marker {
            if opts.version_id.is_none() {
                return Err(to_object_err(Error::from(DiskError::FileNotFound), vec![bucket, object]));
            }
            return Err(to_object_err(Error::from(DiskError::MethodNotAllowed), vec![bucket, object]));
        }

        if object_info.size == 0 {
            return Ok(GetObjectReader {
                stream: Box::new(std::io::Cursor::new(Vec::new())),
                object_info,
            });
        }

        let (offset, length) = match &range {
            Some(spec) => spec.get_offset_length(object_info.size)?,
            None => (0, object_info.size),
        };

        let (rd, mut wd) = tokio::io::duplex(DEFAULT_READ_BUFFER_SIZE);

        // Readers run in shard-position order: shuffle the drives (and
        // any inline shard payloads) by the object's distribution.
        let shuffled_disks = Self::shuffle_disks(&disks, &fi.erasure.distribution);
        let mut shard_data: Vec<Option<bytes::Bytes>> = vec![None; metas.len()];
        for (i, meta) in metas.iter().enumerate() {
            let pos = fi.erasure.distribution[i] - 1;
            // Only drives carrying the winning version contribute inline
            // shards; stale copies would decode garbage.
            if disks[i].is_some() {
                shard_data[pos] = meta.as_ref().and_then(|m| m.data.clone());
            }
        }

        let bucket = bucket.to_owned();
        let object = object.to_owned();
        let fi_task = fi.clone();
        tokio::spawn(async move {
            // Keep the read lock for the lifetime of the stream.
            let _guard = read_lock_guard;
            if let Err(err) = Self::read_object_stream(
                &fi_task,
                &shuffled_disks,
                &shard_data,
                &bucket,
                &object,
                offset as u64,
                length as u64,
                &mut wd,
            )
            .await
            {
                error!("streaming read of {bucket}/{object} failed: {err}");
            }
        });

        let mut object_info = object_info;
        object_info.size = length;

        Ok(GetObjectReader {
            stream: Box::new(rd),
            object_info,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, data))]
    async fn put_object(&self, bucket: &str, object: &str, data: &mut PutObjReader, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let disks = self.get_disks_internal().await;

        let mut user_defined = opts.user_defined.clone();
        let parity_drives = self.parity_for(opts, &user_defined, disks.len());
        let data_drives = disks.len() - parity_drives;
        let mut write_quorum = data_drives;
        if data_drives == parity_drives {
            write_quorum += 1;
        }

        let mut fi = FileInfo::new([bucket, object].join("/").as_str(), data_drives, parity_drives);

        fi.version_id = match &opts.version_id {
            Some(vid) => Some(Uuid::parse_str(vid).map_err(Error::other)?),
            None => None,
        };
        if opts.versioned && fi.version_id.is_none() {
            fi.version_id = Some(Uuid::new_v4());
        }
        fi.data_dir = Some(Uuid::new_v4());

        let parts_metadata = vec![fi.clone(); disks.len()];
        let (shuffled_disks, mut parts_metadatas) = Self::shuffle_disks_and_parts_metadata(&disks, &parts_metadata, &fi);

        let tmp_dir = Uuid::new_v4().to_string();
        let tmp_object = format!("{}/{}/part.1", tmp_dir, fi.data_dir.unwrap());

        let erasure = Erasure::new(fi.erasure.data_blocks, fi.erasure.parity_blocks, fi.erasure.block_size);
        let is_inline = self
            .storage_class
            .should_inline(erasure.shard_file_size(data.size()), opts.versioned);

        let (mut writers, w_size) = match self
            .encode_to_tmp(&shuffled_disks, &erasure, &tmp_object, data, is_inline, write_quorum)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();
                return Err(to_object_err(err, vec![bucket, object]));
            }
        };

        if (w_size as i64) < data.size() {
            self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();
            return Err(Error::other(format!(
                "incomplete body: wrote {} of {} bytes",
                w_size,
                data.size()
            )));
        }

        let etag = match &opts.preserve_etag {
            Some(etag) => etag.clone(),
            None => data.etag(),
        };
        user_defined.insert("etag".to_owned(), etag.clone());

        let actual_size = if data.actual_size() >= 0 { data.actual_size() } else { w_size as i64 };

        let mod_time = opts.mod_time.or(Some(OffsetDateTime::now_utc()));

        for (i, pfi) in parts_metadatas.iter_mut().enumerate() {
            pfi.metadata = user_defined.clone();
            if is_inline {
                if let Some(writer) = writers[i].take() {
                    pfi.data = writer.into_inline_data().map(bytes::Bytes::from);
                }
                pfi.set_inline_data();
            }
            pfi.mod_time = mod_time;
            pfi.size = w_size as i64;
            pfi.versioned = opts.versioned || opts.version_suspended;
            pfi.add_object_part(1, etag.clone(), w_size as usize, mod_time, actual_size, None, None);
            pfi.replication_state_internal = Some(opts.put_replication_state());
        }

        drop(writers);

        // The write lock is taken after encoding so slow uploads do not
        // hold the namespace.
        let lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_write_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let (online_disks, old_data_dir) = Self::rename_data(
            &shuffled_disks,
            GARNET_META_TMP_BUCKET,
            &tmp_dir,
            &parts_metadatas,
            bucket,
            object,
            write_quorum,
        )
        .await?;

        if let Some(old_dir) = old_data_dir {
            self.commit_rename_data_dir(&shuffled_disks, bucket, object, &old_dir, write_quorum)
                .await;
        }

        drop(lock_guard);

        self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();

        let online_count = online_disks.iter().flatten().count();
        if online_count < disks.len() {
            // Degraded write: leave a marker for the healer.
            let _ = self
                .add_partial(bucket, object, &fi.version_id.map(|v| v.to_string()).unwrap_or_default())
                .await;
        }

        for (i, disk) in online_disks.iter().enumerate() {
            if disk.is_some() {
                fi = parts_metadatas[i].clone();
                break;
            }
        }
        fi.is_latest = true;

        Ok(ObjectInfo::from_file_info(&fi, bucket, object, opts.versioned || opts.version_suspended))
    }
}

#[async_trait::async_trait]
impl StorageAPI for SetDisks {
    async fn new_ns_lock(&self, bucket: &str, object: &str) -> Result<NamespaceLock> {
        Ok(NamespaceLock::new(self.lockers.clone(), &self.locker_owner, bucket, object))
    }

    async fn storage_info(&self) -> StorageInfo {
        let disks = self.get_disks_internal().await;
        let mut info = StorageInfo::default();
        for disk in disks.iter() {
            match disk {
                Some(disk) => match disk.disk_info(&DiskInfoOptions::default()).await {
                    Ok(di) => {
                        info.online_disks += 1;
                        info.disks.push(di);
                    }
                    Err(_) => info.offline_disks += 1,
                },
                None => info.offline_disks += 1,
            }
        }
        info
    }

    async fn local_storage_info(&self) -> StorageInfo {
        self.storage_info().await
    }

    async fn make_bucket(&self, bucket: &str, opts: &MakeBucketOptions) -> Result<()> {
        let disks = self.get_disks_internal().await;
        let write_quorum = disks.len() / 2 + 1;

        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            futures.push(async move {
                match disk {
                    Some(disk) => disk.make_volume(bucket).await,
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(disks.len());
        for result in join_all(futures).await {
            match result {
                Ok(()) => errors.push(None),
                Err(DiskError::VolumeExists) if opts.force_create => errors.push(None),
                Err(err) => errors.push(Some(err)),
            }
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, BUCKET_OP_IGNORED_ERRS, write_quorum) {
            // Roll back the drives that succeeded so no half-created
            // bucket lingers.
            for (i, disk) in disks.iter().enumerate() {
                if errors[i].is_none() {
                    if let Some(disk) = disk {
                        let _ = disk.delete_volume(bucket).await;
                    }
                }
            }
            return Err(to_object_err(err.into(), vec![bucket]));
        }

        Ok(())
    }

    async fn get_bucket_info(&self, bucket: &str, _opts: &BucketOptions) -> Result<BucketInfo> {
        let disks = self.get_disks_internal().await;

        let mut futures = Vec::new();
        for disk in disks.iter().flatten() {
            futures.push(disk.stat_volume(bucket));
        }

        let mut errors = Vec::new();
        let mut info = None;
        for result in join_all(futures).await {
            match result {
                Ok(vi) => {
                    if info.is_none() {
                        info = Some(BucketInfo {
                            name: vi.name,
                            created: vi.created,
                            ..Default::default()
                        });
                    }
                    errors.push(None);
                }
                Err(err) => errors.push(Some(err)),
            }
        }

        let read_quorum = disks.len() / 2;
        if let Some(err) = reduce_read_quorum_errs(&errors, BUCKET_OP_IGNORED_ERRS, read_quorum.max(1)) {
            return Err(to_object_err(err.into(), vec![bucket]));
        }

        info.ok_or_else(|| to_object_err(Error::from(DiskError::VolumeNotFound), vec![bucket]))
    }

    async fn list_bucket(&self, _opts: &BucketOptions) -> Result<Vec<BucketInfo>> {
        let disks = self.get_disks_internal().await;
        for disk in disks.iter().flatten() {
            if let Ok(volumes) = disk.list_volumes().await {
                return Ok(volumes
                    .into_iter()
                    .map(|v| BucketInfo {
                        name: v.name,
                        created: v.created,
                        ..Default::default()
                    })
                    .collect());
            }
        }
        Ok(Vec::new())
    }

    async fn delete_bucket(&self, bucket: &str, opts: &DeleteBucketOptions) -> Result<()> {
        let disks = self.get_disks_internal().await;
        let write_quorum = disks.len() / 2 + 1;

        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            futures.push(async move {
                match disk {
                    Some(disk) => {
                        if opts.force {
                            disk.delete(
                                bucket,
                                "",
                                DeleteOptions {
                                    recursive: true,
                                    ..Default::default()
                                },
                            )
                            .await
                            .ok();
                        }
                        disk.delete_volume(bucket).await
                    }
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(disks.len());
        for result in join_all(futures).await {
            errors.push(result.err());
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, BUCKET_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket]));
        }
        Ok(())
    }

    async fn get_object_info(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let _read_lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_read_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let (fi, _, _) = self
            .get_object_fileinfo(bucket, object, opts, false)
            .await
            .map_err(|err| to_object_err(err, vec![bucket, object]))?;

        Ok(ObjectInfo::from_file_info(&fi, bucket, object, opts.versioned || opts.version_suspended))
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        src_info: &mut ObjectInfo,
        _src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        // Same-object copy is a metadata update; cross-object copy goes
        // through the data path.
        if src_bucket == dst_bucket && src_object == dst_object && src_info.metadata_only {
            let mut opts = dst_opts.clone();
            opts.eval_metadata = Some(src_info.user_defined.clone());
            return self.put_object_metadata(src_bucket, src_object, &opts).await;
        }

        let mut reader = self
            .get_object_reader(src_bucket, src_object, None, http::HeaderMap::new(), _src_opts)
            .await?;
        let body = reader.read_all().await?;
        let mut put_reader = PutObjReader::from_vec(body);
        self.put_object(dst_bucket, dst_object, &mut put_reader, dst_opts).await
    }

    async fn delete_object(&self, bucket: &str, object: &str, opts: ObjectOptions) -> Result<ObjectInfo> {
        if opts.delete_prefix {
            self.delete_all(bucket, object).await?;
            return Ok(ObjectInfo {
                bucket: bucket.to_string(),
                name: object.to_string(),
                ..Default::default()
            });
        }

        let lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_write_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let disks = self.get_disks_internal().await;
        let write_quorum = disks.len() / 2 + 1;

        let version_id = match &opts.version_id {
            Some(vid) => Some(Uuid::parse_str(vid).map_err(|_| {
                Error::InvalidVersionId(bucket.to_string(), object.to_string(), vid.clone())
            })?),
            None => None,
        };

        // Replication status write-back for an already deleted version:
        // patch the stored replication state instead of removing data.
        if let Some(drs) = &opts.delete_replication {
            if version_id.is_some() {
                let purge_complete = drs.composite_version_purge_status() == garnetfs_filemeta::VersionPurgeStatusType::Complete;
                let marker_done = drs.composite_replication_status() == garnetfs_filemeta::ReplicationStatusType::Completed
                    && drs.version_purge_status_internal.is_none();

                if !purge_complete || marker_done {
                    let updated = self
                        .update_delete_replication_state(&disks, bucket, object, version_id, drs, write_quorum)
                        .await?;
                    drop(lock_guard);
                    return Ok(updated);
                }
                // Purge completed everywhere: fall through and remove the
                // version for real.
            }
        }

        let versioned = opts.versioned || opts.version_suspended;

        let mut fi = FileInfo {
            name: object.to_string(),
            version_id,
            ..Default::default()
        };

        if versioned && version_id.is_none() {
            // Versioned delete without a version: insert a delete marker.
            fi.deleted = true;
            fi.version_id = if opts.versioned { Some(Uuid::new_v4()) } else { None };
            fi.mod_time = opts.mod_time.or(Some(OffsetDateTime::now_utc()));
            fi.replication_state_internal = opts.delete_replication.clone();
            fi.versioned = versioned;

            let errors = Self::delete_version_fanout(&disks, bucket, object, &fi, true).await;
            if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
                return Err(to_object_err(err.into(), vec![bucket, object]));
            }

            drop(lock_guard);
            let mut oi = ObjectInfo::from_file_info(&fi, bucket, object, versioned);
            oi.delete_marker = true;
            return Ok(oi);
        }

        // Hard delete of a specific version (or the whole unversioned
        // object).
        fi.deleted = false;
        fi.mod_time = opts.mod_time.or(Some(OffsetDateTime::now_utc()));
        fi.replication_state_internal = opts.delete_replication.clone();

        let errors = Self::delete_version_fanout(&disks, bucket, object, &fi, false).await;
        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        drop(lock_guard);

        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            version_id,
            ..Default::default()
        })
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
            let mut obj_opts = opts.clone();
            obj_opts.version_id = dobj.version_id.map(|v| v.to_string());
            obj_opts.delete_replication = Some(dobj.replication_state());

            match self.delete_object(bucket, &dobj.object_name, obj_opts).await {
                Ok(oi) => {
                    deleted.push(DeletedObject {
                        delete_marker: oi.delete_marker,
                        delete_marker_version_id: if oi.delete_marker { oi.version_id } else { None },
                        object_name: dobj.object_name.clone(),
                        version_id: dobj.version_id,
                        delete_marker_mtime: oi.mod_time,
                        replication_state: Some(dobj.replication_state()),
                        found: true,
                        ..Default::default()
                    });
                    errors.push(None);
                }
                Err(err) => {
                    deleted.push(DeletedObject {
                        object_name: dobj.object_name.clone(),
                        version_id: dobj.version_id,
                        replication_state: Some(dobj.replication_state()),
                        ..Default::default()
                    });
                    errors.push(Some(err));
                }
            }
        }

        Ok((deleted, errors))
    }

    async fn put_object_metadata(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<ObjectInfo> {
        let lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_write_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let disks = self.get_disks_internal().await;
        let (mut fi, _, online_disks) = self
            .get_object_fileinfo(bucket, object, opts, false)
            .await
            .map_err(|err| to_object_err(err, vec![bucket, object]))?;

        if let Some(eval_metadata) = &opts.eval_metadata {
            for (k, v) in eval_metadata {
                fi.metadata.insert(k.clone(), v.clone());
            }

            // Replication status fields are mirrored into the typed state
            // so readers do not re-parse the string per access.
            let mut state = fi.replication_state_internal.clone().unwrap_or_default();
            if let Some(internal) =
                eval_metadata.get(format!("{RESERVED_METADATA_PREFIX_LOWER}replication-status").as_str())
            {
                state.replication_status_internal = Some(internal.clone());
                state.targets = replication_statuses_map(internal);
            }
            if let Some(purge) =
                eval_metadata.get(format!("{RESERVED_METADATA_PREFIX_LOWER}version-purge-status").as_str())
            {
                state.version_purge_status_internal = Some(purge.clone());
                state.purge_targets = version_purge_statuses_map(purge);
            }
            fi.replication_state_internal = Some(state);
        }

        let write_quorum = fi.write_quorum(self.default_write_quorum());

        let mut futures = Vec::new();
        for disk in online_disks.iter() {
            let fi = fi.clone();
            futures.push(async move {
                match disk {
                    Some(disk) => disk.update_metadata(bucket, object, fi, &UpdateMetadataOpts::default()).await,
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::new();
        for result in join_all(futures).await {
            errors.push(result.err());
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        drop(lock_guard);

        Ok(ObjectInfo::from_file_info(&fi, bucket, object, opts.versioned || opts.version_suspended))
    }

    async fn new_multipart_upload(&self, bucket: &str, object: &str, opts: &ObjectOptions) -> Result<crate::store_api::MultipartUploadResult> {
        self.new_multipart_upload_inner(bucket, object, opts).await
    }

    async fn put_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_id: usize,
        data: &mut PutObjReader,
        opts: &ObjectOptions,
    ) -> Result<crate::store_api::PartInfo> {
        self.put_object_part_inner(bucket, object, upload_id, part_id, data, opts).await
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: usize,
        max_parts: usize,
        opts: &ObjectOptions,
    ) -> Result<crate::store_api::ListPartsInfo> {
        self.list_object_parts_inner(bucket, object, upload_id, part_number_marker, max_parts, opts)
            .await
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
        max_uploads: usize,
    ) -> Result<crate::store_api::ListMultipartsInfo> {
        self.list_multipart_uploads_inner(bucket, prefix, key_marker, upload_id_marker, max_uploads)
            .await
    }

    async fn complete_multipart_upload(
        self: Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        uploaded_parts: Vec<crate::store_api::CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        self.complete_multipart_upload_inner(bucket, object, upload_id, uploaded_parts, opts)
            .await
    }

    async fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &str, opts: &ObjectOptions) -> Result<()> {
        self.abort_multipart_upload_inner(bucket, object, upload_id, opts).await
    }

    async fn walk(
        &self,
        cancel: CancellationToken,
        bucket: &str,
        prefix: &str,
        tx: Sender<ObjectInfoOrErr>,
        opts: WalkOptions,
    ) -> Result<()> {
        let disks = self.get_disks_internal().await;

        // One online drive is enough: the walk only needs the namespace,
        // and entries it misses are caught by the next scanner pass.
        let Some(disk) = disks.iter().flatten().next().cloned() else {
            return Err(Error::ErasureReadQuorum);
        };

        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        let versioned_bucket = bucket.clone();
        tokio::spawn(async move {
            let entries = match disk
                .walk_dir(WalkDirOptions {
                    bucket: bucket.clone(),
                    recursive: true,
                    filter_prefix: if prefix.is_empty() { None } else { Some(prefix.clone()) },
                    forward_to: opts.marker.clone(),
                    ..Default::default()
                })
                .await
            {
                Ok(entries) => entries,
                Err(err) => {
                    let _ = tx
                        .send(ObjectInfoOrErr {
                            item: None,
                            err: Some(err.into()),
                        })
                        .await;
                    return;
                }
            };

            for entry in entries {
                if cancel.is_cancelled() {
                    return;
                }

                let Ok(meta) = FileMeta::load(&entry.metadata) else {
                    continue;
                };
                let Ok(fivs) = meta.into_file_info_versions(&bucket, &entry.name) else {
                    continue;
                };

                // Ascending version order (oldest first) so delete
                // markers always arrive after the versions they shadow.
                let versioned = crate::bucket::versioning_sys::BucketVersioningSys::prefix_enabled(
                    &versioned_bucket,
                    &entry.name,
                )
                .await;

                let mut versions = fivs.versions;
                if opts.latest_only {
                    versions.retain(|v| v.is_latest);
                }
                versions.reverse();

                for fi in versions {
                    let oi = ObjectInfo::from_file_info(&fi, &bucket, &entry.name, versioned);
                    if tx.send(ObjectInfoOrErr { item: Some(oi), err: None }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn add_partial(&self, bucket: &str, object: &str, version_id: &str) -> Result<()> {
        heal::queue_heal_entry(heal::HealEntry {
            bucket: bucket.to_string(),
            object: object.to_string(),
            version_id: version_id.to_string(),
            pool_index: self.pool_index,
            set_index: self.set_index,
        });
        Ok(())
    }

    async fn heal_bucket(&self, bucket: &str, opts: &HealOpts) -> Result<()> {
        self.heal_bucket_inner(bucket, opts).await
    }

    async fn heal_object(&self, bucket: &str, object: &str, version_id: &str, opts: &HealOpts) -> Result<HealResultItem> {
        self.heal_object_inner(bucket, object, version_id, opts).await
    }

    async fn get_disks(&self, _pool_idx: usize, _set_idx: usize) -> Result<Vec<Option<DiskStore>>> {
        Ok(self.get_disks_internal().await)
    }
}

impl SetDisks {
    async fn delete_version_fanout(
        disks: &[Option<DiskStore>],
        bucket: &str,
        object: &str,
        fi: &FileInfo,
        force_del_marker: bool,
    ) -> Vec<Option<DiskError>> {
        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            let fi = fi.clone();
            futures.push(async move {
                match disk {
                    Some(disk) => {
                        disk.delete_version(bucket, object, fi, force_del_marker, DeleteOptions::default())
                            .await
                    }
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        join_all(futures).await.into_iter().map(|r| r.err()).collect()
    }

    /// Patches only the replication state of an existing delete marker or
    /// version, leaving content untouched.
    async fn update_delete_replication_state(
        &self,
        disks: &[Option<DiskStore>],
        bucket: &str,
        object: &str,
        version_id: Option<Uuid>,
        drs: &ReplicationState,
        write_quorum: usize,
    ) -> Result<ObjectInfo> {
        let version_str = version_id.map(|v| v.to_string()).unwrap_or_default();
        let (metas, errors) = Self::read_all_fileinfo(disks, bucket, object, &version_str, false).await;

        if let Some(err) = reduce_read_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, self.default_read_quorum()) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        let (mut fi, _) = Self::find_file_info_in_quorum(&metas, 1)?;
        fi.name = object.to_string();
        fi.replication_state_internal = Some(drs.clone());

        let mut futures = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            let fi = fi.clone();
            futures.push(async move {
                match disk {
                    Some(disk) => disk.update_metadata(bucket, object, fi, &UpdateMetadataOpts::default()).await,
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(disks.len());
        for result in join_all(futures).await {
            errors.push(result.err());
        }
        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        let mut oi = ObjectInfo::from_file_info(&fi, bucket, object, true);
        oi.delete_marker = fi.deleted;
        Ok(oi)
    }
}

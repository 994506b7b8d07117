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

//! Multipart state machine. Uploads live under a SHA-256 shard of
//! `bucket/object` in the multipart area: a fresh xl.meta at creation,
//! one shard file plus one msgpack meta record per part, and a final
//! rename of the whole upload directory into the object path on
//! complete.

use super::*;
use crate::disk::DiskAPI as _;
use crate::disk::GARNET_META_MULTIPART_BUCKET;
use crate::store_api::{CompletePart, ListMultipartsInfo, ListPartsInfo, MultipartInfo, MultipartUploadResult, PartInfo,
    get_complete_multipart_md5};
use garnetfs_filemeta::ObjectPartInfo;
use garnetfs_utils::path::trim_etag;
use garnetfs_utils::sha256_hex;

/// Uploads older than this are swept into the trash.
pub const STALE_UPLOAD_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// All but the last part must be at least this large.
pub const GLOBAL_MIN_PART_SIZE: i64 = 5 * 1024 * 1024;

pub const MAX_PARTS_COUNT: usize = 10_000;

fn is_min_allowed_part_size(size: i64) -> bool {
    size >= GLOBAL_MIN_PART_SIZE
}

impl SetDisks {
    /// `multipart/<sha256(bucket/object)>` shards the upload namespace.
    pub fn get_multipart_sha_dir(bucket: &str, object: &str) -> String {
        sha256_hex(format!("{bucket}/{object}").as_bytes())
    }

    pub fn get_upload_id_dir(bucket: &str, object: &str, upload_id: &str) -> String {
        let upload_uuid = Self::decode_upload_id(upload_id).unwrap_or_else(|| upload_id.to_string());
        format!("{}/{}", Self::get_multipart_sha_dir(bucket, object), upload_uuid)
    }

    fn encode_upload_id(upload_uuid: &str) -> String {
        let deployment = crate::global::get_global_deployment_id().unwrap_or_default();
        base64_simd::URL_SAFE_NO_PAD.encode_to_string(format!("{deployment}.{upload_uuid}").as_bytes())
    }

    fn decode_upload_id(upload_id: &str) -> Option<String> {
        let decoded = base64_simd::URL_SAFE_NO_PAD.decode_to_vec(upload_id).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        decoded.split_once('.').map(|(_, uuid)| uuid.to_string())
    }

    /// Verifies the upload exists at read quorum and returns the upload's
    /// base metadata plus every drive's copy.
    pub async fn check_upload_id_exists(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        write_quorum_check: bool,
    ) -> Result<(FileInfo, Vec<Option<FileInfo>>)> {
        let disks = self.get_disks_internal().await;
        let upload_id_path = Self::get_upload_id_dir(bucket, object, upload_id);

        let (metas, errors) = Self::read_all_fileinfo(&disks, GARNET_META_MULTIPART_BUCKET, &upload_id_path, "", false).await;

        let quorum = if write_quorum_check {
            self.default_write_quorum()
        } else {
            self.default_read_quorum()
        };

        let reduced = if write_quorum_check {
            reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, quorum)
        } else {
            reduce_read_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, quorum)
        };
        if let Some(err) = reduced {
            if matches!(err, DiskError::FileNotFound) {
                return Err(Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()));
            }
            return Err(to_object_err(err.into(), vec![bucket, object, upload_id]));
        }

        let (fi, _) = Self::find_file_info_in_quorum(&metas, 1)
            .map_err(|_| Error::InvalidUploadId(bucket.to_string(), object.to_string(), upload_id.to_string()))?;

        Ok((fi, metas))
    }

    pub(super) async fn new_multipart_upload_inner(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<MultipartUploadResult> {
        let disks = self.get_disks_internal().await;

        let mut user_defined = opts.user_defined.clone();
        if let Some(etag) = &opts.preserve_etag {
            user_defined.insert("etag".to_owned(), etag.clone());
        }

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
        let (shuffled_disks, mut shuffled_metas) = Self::shuffle_disks_and_parts_metadata(&disks, &parts_metadata, &fi);

        let mod_time = opts.mod_time.unwrap_or(OffsetDateTime::now_utc());
        for meta in shuffled_metas.iter_mut() {
            meta.metadata = user_defined.clone();
            meta.mod_time = Some(mod_time);
            meta.fresh = true;
        }

        let upload_uuid = format!("{}x{}", Uuid::new_v4(), mod_time.unix_timestamp_nanos());
        let upload_id = Self::encode_upload_id(&upload_uuid);
        let upload_path = format!("{}/{}", Self::get_multipart_sha_dir(bucket, object), upload_uuid);

        Self::write_unique_file_info(
            &shuffled_disks,
            bucket,
            GARNET_META_MULTIPART_BUCKET,
            &upload_path,
            &shuffled_metas,
            write_quorum,
        )
        .await
        .map_err(|e| to_object_err(e.into(), vec![bucket, object]))?;

        Ok(MultipartUploadResult { upload_id })
    }

    pub(super) async fn put_object_part_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_id: usize,
        data: &mut PutObjReader,
        _opts: &ObjectOptions,
    ) -> Result<PartInfo> {
        if part_id == 0 || part_id > MAX_PARTS_COUNT {
            return Err(Error::InvalidPart(part_id, bucket.to_string(), object.to_string()));
        }

        let (fi, _) = self.check_upload_id_exists(bucket, object, upload_id, false).await?;
        let upload_id_path = Self::get_upload_id_dir(bucket, object, upload_id);
        let write_quorum = fi.write_quorum(self.default_write_quorum());

        let disks = self.get_disks_internal().await;
        let shuffled_disks = Self::shuffle_disks(&disks, &fi.erasure.distribution);

        let erasure = Erasure::new(fi.erasure.data_blocks, fi.erasure.parity_blocks, fi.erasure.block_size);

        let tmp_dir = Uuid::new_v4().to_string();
        let tmp_part = format!("{tmp_dir}/part.{part_id}");

        let (writers, w_size) = match self
            .encode_to_tmp(&shuffled_disks, &erasure, &tmp_part, data, false, write_quorum)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();
                return Err(to_object_err(err, vec![bucket, object]));
            }
        };
        drop(writers);

        let etag = data.etag();
        let mod_time = Some(OffsetDateTime::now_utc());
        let actual_size = if data.actual_size() >= 0 { data.actual_size() } else { w_size as i64 };

        let part_info = ObjectPartInfo {
            etag: etag.clone(),
            number: part_id,
            size: w_size as usize,
            actual_size,
            mod_time,
            ..Default::default()
        };
        let part_meta = part_info.marshal_msg().map_err(Error::from)?;

        let data_dir = fi.data_dir.unwrap_or(Uuid::nil());
        let dst_part = format!("{upload_id_path}/{data_dir}/part.{part_id}");

        // Atomic rename-into-place per drive, with the msgpack part meta
        // written alongside.
        let mut futures = Vec::with_capacity(shuffled_disks.len());
        for disk in shuffled_disks.iter() {
            let tmp_part = tmp_part.clone();
            let dst_part = dst_part.clone();
            let part_meta = part_meta.clone();
            futures.push(async move {
                match disk {
                    Some(disk) => {
                        disk.rename_part(GARNET_META_TMP_BUCKET, &tmp_part, GARNET_META_MULTIPART_BUCKET, &dst_part, part_meta)
                            .await
                    }
                    None => Err(DiskError::DiskNotFound),
                }
            });
        }

        let mut errors = Vec::with_capacity(shuffled_disks.len());
        for result in join_all(futures).await {
            errors.push(result.err());
        }

        self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();

        if let Some(err) = reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        Ok(PartInfo {
            part_num: part_id,
            last_mod: mod_time,
            size: w_size as usize,
            etag: Some(etag),
            actual_size,
        })
    }

    /// Reads the msgpack part records for the requested part numbers,
    /// first drive that has each one wins.
    async fn read_parts(
        disks: &[Option<DiskStore>],
        upload_id_path: &str,
        data_dir: Uuid,
        part_numbers: &[usize],
    ) -> Vec<Option<ObjectPartInfo>> {
        let mut out = vec![None; part_numbers.len()];
        for (i, part_number) in part_numbers.iter().enumerate() {
            let path = format!("{upload_id_path}/{data_dir}/part.{part_number}.meta");
            for disk in disks.iter().flatten() {
                if let Ok(buf) = disk.read_all(GARNET_META_MULTIPART_BUCKET, &path).await {
                    if let Ok(info) = ObjectPartInfo::unmarshal(&buf) {
                        out[i] = Some(info);
                        break;
                    }
                }
            }
        }
        out
    }

    pub(super) async fn list_object_parts_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: usize,
        max_parts: usize,
        _opts: &ObjectOptions,
    ) -> Result<ListPartsInfo> {
        let (fi, _) = self.check_upload_id_exists(bucket, object, upload_id, false).await?;
        let upload_id_path = Self::get_upload_id_dir(bucket, object, upload_id);
        let data_dir = fi.data_dir.unwrap_or(Uuid::nil());

        let disks = self.get_disks_internal().await;

        // Discover which parts exist from the upload's data dir listing.
        let mut part_numbers = Vec::new();
        for disk in disks.iter().flatten() {
            if let Ok(entries) = disk
                .list_dir("", GARNET_META_MULTIPART_BUCKET, &format!("{upload_id_path}/{data_dir}"), -1)
                .await
            {
                for entry in entries {
                    if let Some(num) = entry.strip_prefix("part.").and_then(|rest| rest.strip_suffix(".meta")) {
                        if let Ok(num) = num.parse::<usize>() {
                            part_numbers.push(num);
                        }
                    }
                }
                break;
            }
        }
        part_numbers.sort_unstable();
        part_numbers.dedup();
        part_numbers.retain(|n| *n > part_number_marker);

        let truncated = max_parts > 0 && part_numbers.len() > max_parts;
        if truncated {
            part_numbers.truncate(max_parts);
        }

        let parts = Self::read_parts(&disks, &upload_id_path, data_dir, &part_numbers).await;

        let mut result = ListPartsInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id: upload_id.to_string(),
            part_number_marker,
            max_parts,
            is_truncated: truncated,
            user_defined: fi.metadata.clone(),
            ..Default::default()
        };

        for part in parts.into_iter().flatten() {
            result.parts.push(PartInfo {
                part_num: part.number,
                last_mod: part.mod_time,
                size: part.size,
                etag: Some(part.etag.clone()),
                actual_size: part.actual_size,
            });
        }
        result.next_part_number_marker = result.parts.last().map(|p| p.part_num).unwrap_or(part_number_marker);

        Ok(result)
    }

    pub(super) async fn list_multipart_uploads_inner(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo> {
        let mut result = ListMultipartsInfo {
            key_marker,
            upload_id_marker,
            max_uploads,
            prefix: prefix.to_string(),
            ..Default::default()
        };

        // Upload listing is served per object: the shard dir is keyed by
        // the full object name.
        if prefix.is_empty() {
            return Ok(result);
        }

        let disks = self.get_disks_internal().await;
        let sha_dir = Self::get_multipart_sha_dir(bucket, prefix);

        for disk in disks.iter().flatten() {
            let entries = match disk.list_dir("", GARNET_META_MULTIPART_BUCKET, &sha_dir, -1).await {
                Ok(entries) => entries,
                Err(DiskError::FileNotFound) => return Ok(result),
                Err(_) => continue,
            };

            for entry in entries {
                let upload_uuid = entry.trim_end_matches('/');
                let upload_path = format!("{sha_dir}/{upload_uuid}");
                let Ok(fi) = disk
                    .read_version("", GARNET_META_MULTIPART_BUCKET, &upload_path, "", &ReadOptions::default())
                    .await
                else {
                    continue;
                };

                result.uploads.push(MultipartInfo {
                    bucket: bucket.to_string(),
                    object: prefix.to_string(),
                    upload_id: Self::encode_upload_id(upload_uuid),
                    initiated: fi.mod_time,
                    user_defined: fi.metadata.clone(),
                });

                if max_uploads > 0 && result.uploads.len() >= max_uploads {
                    result.is_truncated = true;
                    break;
                }
            }
            break;
        }

        Ok(result)
    }

    pub(super) async fn complete_multipart_upload_inner(
        self: Arc<Self>,
        bucket: &str,
        object: &str,
        upload_id: &str,
        uploaded_parts: Vec<CompletePart>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo> {
        if uploaded_parts.is_empty() {
            return Err(Error::InvalidPart(0, bucket.to_string(), object.to_string()));
        }

        let (mut fi, metas) = self.check_upload_id_exists(bucket, object, upload_id, true).await?;
        let upload_id_path = Self::get_upload_id_dir(bucket, object, upload_id);
        let write_quorum = fi.write_quorum(self.default_write_quorum());
        let data_dir = fi.data_dir.unwrap_or(Uuid::nil());

        let disks = self.get_disks_internal().await;

        let part_numbers: Vec<usize> = uploaded_parts.iter().map(|p| p.part_num).collect();
        let stored_parts = Self::read_parts(&disks, &upload_id_path, data_dir, &part_numbers).await;

        if stored_parts.len() != uploaded_parts.len() {
            return Err(Error::other("part record count mismatch"));
        }

        let mut object_size = 0usize;
        let mut object_actual_size = 0i64;
        fi.parts = Vec::with_capacity(uploaded_parts.len());

        for (i, requested) in uploaded_parts.iter().enumerate() {
            let Some(stored) = &stored_parts[i] else {
                return Err(Error::InvalidPart(requested.part_num, bucket.to_string(), object.to_string()));
            };

            if stored.number != requested.part_num {
                return Err(Error::InvalidPart(requested.part_num, bucket.to_string(), object.to_string()));
            }

            // ETags compare without surrounding quotes.
            let client_etag = requested.etag.as_deref().map(trim_etag);
            if client_etag != Some(trim_etag(&stored.etag)) {
                return Err(Error::InvalidPart(requested.part_num, stored.etag.clone(), requested.etag.clone().unwrap_or_default()));
            }

            if (i < uploaded_parts.len() - 1) && !is_min_allowed_part_size(stored.actual_size) {
                return Err(Error::EntityTooSmall(requested.part_num, stored.actual_size, GLOBAL_MIN_PART_SIZE));
            }

            object_size += stored.size;
            object_actual_size += stored.actual_size;

            fi.parts.push(ObjectPartInfo {
                etag: stored.etag.clone(),
                number: requested.part_num,
                size: stored.size,
                actual_size: stored.actual_size,
                mod_time: stored.mod_time,
                ..Default::default()
            });
        }

        fi.size = object_size as i64;
        fi.mod_time = opts.mod_time.or(Some(OffsetDateTime::now_utc()));
        fi.versioned = opts.versioned || opts.version_suspended;

        let etag = match opts.user_defined.get("etag") {
            Some(etag) => etag.clone(),
            None => get_complete_multipart_md5(&uploaded_parts),
        };
        fi.metadata.insert("etag".to_owned(), etag);
        fi.metadata
            .insert(format!("{RESERVED_METADATA_PREFIX_LOWER}actual-size"), object_actual_size.to_string());
        fi.replication_state_internal = Some(opts.put_replication_state());

        // Rebuild the per-drive copies around the final part list.
        let mut parts_metadata = Vec::with_capacity(disks.len());
        for meta in metas.iter() {
            let mut copy = fi.clone();
            if let Some(meta) = meta {
                copy.erasure.index = meta.erasure.index;
            }
            parts_metadata.push(copy);
        }

        // Order copies into shuffled (distribution) positions.
        let shuffled_disks = Self::shuffle_disks(&disks, &fi.erasure.distribution);
        let mut shuffled_metas: Vec<FileInfo> = vec![FileInfo::default(); disks.len()];
        for (index, meta) in parts_metadata.iter().enumerate() {
            let block_index = fi.erasure.distribution[index];
            let mut meta = meta.clone();
            meta.erasure.index = block_index;
            shuffled_metas[block_index - 1] = meta;
        }

        let lock_guard = if !opts.no_lock {
            let ns_lock = self.new_ns_lock(bucket, object).await?;
            Some(ns_lock.get_write_lock(get_lock_acquire_timeout()).await?)
        } else {
            None
        };

        let (online_disks, old_data_dir) = Self::rename_data(
            &shuffled_disks,
            GARNET_META_MULTIPART_BUCKET,
            &upload_id_path,
            &shuffled_metas,
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

        // The upload directory is garbage now; purge it off the hot path.
        let cleanup = self.clone();
        let upload_path = upload_id_path.clone();
        tokio::spawn(async move {
            let _ = cleanup.delete_all(GARNET_META_MULTIPART_BUCKET, &upload_path).await;
        });

        let mut final_fi = fi.clone();
        for (i, disk) in online_disks.iter().enumerate() {
            if disk.is_some() {
                final_fi = shuffled_metas[i].clone();
                break;
            }
        }
        final_fi.is_latest = true;

        Ok(ObjectInfo::from_file_info(&final_fi, bucket, object, opts.versioned || opts.version_suspended))
    }

    pub(super) async fn abort_multipart_upload_inner(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        _opts: &ObjectOptions,
    ) -> Result<()> {
        self.check_upload_id_exists(bucket, object, upload_id, false).await?;
        let upload_id_path = Self::get_upload_id_dir(bucket, object, upload_id);
        self.delete_all(GARNET_META_MULTIPART_BUCKET, &upload_id_path).await
    }

    /// Sweeps uploads whose newest activity (xl.meta or any part) is
    /// older than `expiry` into the trash.
    pub async fn cleanup_stale_uploads(&self, expiry: Duration) {
        let now = OffsetDateTime::now_utc();
        let disks = self.get_disks_internal().await;

        for disk in disks.iter().flatten() {
            if !disk.is_local() {
                continue;
            }

            let sha_dirs = match disk.list_dir("", GARNET_META_MULTIPART_BUCKET, "", -1).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for sha_dir in sha_dirs {
                let sha_dir = sha_dir.trim_end_matches('/').to_string();
                let uploads = match disk.list_dir("", GARNET_META_MULTIPART_BUCKET, &sha_dir, -1).await {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };

                for upload in uploads {
                    let upload_dir = format!("{}/{}", sha_dir, upload.trim_end_matches('/'));

                    let mut newest = OffsetDateTime::UNIX_EPOCH;
                    if let Ok(fi) = disk
                        .read_version("", GARNET_META_MULTIPART_BUCKET, &upload_dir, "", &ReadOptions::default())
                        .await
                    {
                        if let Some(t) = fi.mod_time {
                            newest = newest.max(t);
                        }

                        // Part activity extends the upload's life.
                        if let Some(data_dir) = fi.data_dir {
                            if let Ok(entries) = disk
                                .list_dir("", GARNET_META_MULTIPART_BUCKET, &format!("{upload_dir}/{data_dir}"), -1)
                                .await
                            {
                                for entry in entries {
                                    if !entry.ends_with(".meta") {
                                        continue;
                                    }
                                    if let Ok(buf) = disk
                                        .read_all(GARNET_META_MULTIPART_BUCKET, &format!("{upload_dir}/{data_dir}/{entry}"))
                                        .await
                                    {
                                        if let Ok(part) = ObjectPartInfo::unmarshal(&buf) {
                                            if let Some(t) = part.mod_time {
                                                newest = newest.max(t);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }

                    if newest == OffsetDateTime::UNIX_EPOCH {
                        continue;
                    }

                    if now - newest > expiry {
                        warn!("sweeping stale multipart upload {}", upload_dir);
                        let _ = disk
                            .delete(
                                GARNET_META_MULTIPART_BUCKET,
                                &upload_dir,
                                DeleteOptions {
                                    recursive: true,
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                }
            }
        }
    }
}

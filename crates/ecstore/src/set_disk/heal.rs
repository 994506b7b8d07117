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

//! Healing. The authoritative version is whatever a read quorum of
//! drives agrees on; drives that are missing, outdated or bitrot-corrupt
//! get their shards re-encoded from the survivors and their xl.meta
//! rewritten.

use super::*;
use crate::disk::DiskAPI as _;
use crate::disk::has_part_err;
use std::sync::OnceLock;
use tokio::sync::mpsc;

/// A degraded write queued for the background healer.
#[derive(Debug, Clone)]
pub struct HealEntry {
    pub bucket: String,
    pub object: String,
    pub version_id: String,
    pub pool_index: usize,
    pub set_index: usize,
}

static HEAL_QUEUE: OnceLock<mpsc::Sender<HealEntry>> = OnceLock::new();
static HEAL_QUEUE_RX: OnceLock<tokio::sync::Mutex<mpsc::Receiver<HealEntry>>> = OnceLock::new();

fn heal_queue() -> &'static mpsc::Sender<HealEntry> {
    HEAL_QUEUE.get_or_init(|| {
        let (tx, rx) = mpsc::channel(10_000);
        let _ = HEAL_QUEUE_RX.set(tokio::sync::Mutex::new(rx));
        tx
    })
}

/// Non-blocking enqueue; a full queue drops the entry, the scanner will
/// find the object again.
pub fn queue_heal_entry(entry: HealEntry) {
    let _ = heal_queue().try_send(entry);
}

/// Drains queued heal entries, used by the background healer loop.
pub async fn drain_heal_entries(max: usize) -> Vec<HealEntry> {
    let _ = heal_queue();
    let mut out = Vec::new();
    if let Some(rx) = HEAL_QUEUE_RX.get() {
        let mut rx = rx.lock().await;
        while out.len() < max {
            match rx.try_recv() {
                Ok(entry) => out.push(entry),
                Err(_) => break,
            }
        }
    }
    out
}

impl SetDisks {
    pub(super) async fn heal_bucket_inner(&self, bucket: &str, _opts: &HealOpts) -> Result<()> {
        let disks = self.get_disks_internal().await;
        let write_quorum = disks.len() / 2 + 1;

        let mut missing = Vec::new();
        let mut errors = Vec::with_capacity(disks.len());
        for disk in disks.iter() {
            match disk {
                Some(disk) => match disk.stat_volume(bucket).await {
                    Ok(_) => errors.push(None),
                    Err(DiskError::VolumeNotFound) => {
                        missing.push(disk.clone());
                        errors.push(None);
                    }
                    Err(err) => errors.push(Some(err)),
                },
                None => errors.push(Some(DiskError::DiskNotFound)),
            }
        }

        if let Some(err) = reduce_write_quorum_errs(&errors, BUCKET_OP_IGNORED_ERRS, write_quorum) {
            return Err(to_object_err(err.into(), vec![bucket]));
        }

        for disk in missing {
            if let Err(err) = disk.make_volume(bucket).await {
                if err != DiskError::VolumeExists {
                    warn!("heal_bucket failed to recreate {} on {}: {}", bucket, disk.to_string(), err);
                }
            }
        }

        Ok(())
    }

    /// Re-encodes the authoritative version onto every drive that lost
    /// it. Returns the before/after drive states for the operator.
    pub(super) async fn heal_object_inner(
        &self,
        bucket: &str,
        object: &str,
        version_id: &str,
        opts: &HealOpts,
    ) -> Result<HealResultItem> {
        let disks = self.get_disks_internal().await;

        let (metas, errors) = Self::read_all_fileinfo(&disks, bucket, object, version_id, false).await;

        // When the majority of drives have no record at all, the object
        // is effectively gone; residual shards are garbage.
        let missing_meta = errors
            .iter()
            .filter(|e| matches!(e, Some(DiskError::FileNotFound) | Some(DiskError::FileVersionNotFound)))
            .count();
        if missing_meta > disks.len() / 2 {
            if !opts.dry_run && opts.remove_corrupted {
                self.delete_all(bucket, object).await.ok();
            }
            return Err(to_object_err(Error::from(DiskError::FileNotFound), vec![bucket, object]));
        }

        let read_quorum = metas
            .iter()
            .flatten()
            .find(|m| !m.deleted && m.erasure.data_blocks > 0)
            .map(|m| m.erasure.data_blocks)
            .unwrap_or(self.default_read_quorum());

        if let Some(err) = reduce_read_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, read_quorum) {
            return Err(to_object_err(err.into(), vec![bucket, object]));
        }

        let (latest, _) = Self::find_file_info_in_quorum(&metas, read_quorum)?;

        let mut result = HealResultItem {
            bucket: bucket.to_string(),
            object: object.to_string(),
            version_id: version_id.to_string(),
            disk_count: disks.len(),
            parity_blocks: latest.erasure.parity_blocks,
            data_blocks: latest.erasure.data_blocks,
            ..Default::default()
        };

        // Classify each drive against the authoritative version.
        let shuffled_disks = Self::shuffle_disks(&disks, &latest.erasure.distribution);
        let mut shuffled_metas: Vec<Option<FileInfo>> = vec![None; disks.len()];
        for (i, meta) in metas.iter().enumerate() {
            let block_index = latest.erasure.distribution[i];
            shuffled_metas[block_index - 1] = meta.clone();
        }

        let mut needs_heal = vec![false; shuffled_disks.len()];
        for (i, disk) in shuffled_disks.iter().enumerate() {
            match (&shuffled_metas[i], disk) {
                (Some(meta), Some(disk)) if meta.mod_time == latest.mod_time => {
                    if latest.deleted || latest.inline_data() {
                        result.before_drives.push("online".to_string());
                        continue;
                    }
                    // Verify shard presence and bitrot.
                    match disk.verify_file(bucket, object, meta).await {
                        Ok(resp) if !has_part_err(&resp.results) => {
                            result.before_drives.push("online".to_string());
                        }
                        _ => {
                            needs_heal[i] = true;
                            result.before_drives.push("corrupt".to_string());
                        }
                    }
                }
                (_, Some(_)) => {
                    needs_heal[i] = true;
                    result.before_drives.push("missing".to_string());
                }
                (_, None) => {
                    result.before_drives.push("offline".to_string());
                }
            }
        }

        if !needs_heal.iter().any(|b| *b) {
            result.after_drives = result.before_drives.clone();
            return Ok(result);
        }

        if opts.dry_run {
            result.after_drives = result.before_drives.clone();
            return Ok(result);
        }

        if !latest.deleted && !latest.inline_data() {
            self.heal_erasure_shards(bucket, object, &latest, &shuffled_disks, &needs_heal)
                .await?;
        }

        // Rewrite xl.meta on the healed drives with their erasure index.
        for (i, disk) in shuffled_disks.iter().enumerate() {
            if !needs_heal[i] {
                continue;
            }
            let Some(disk) = disk else { continue };
            let mut fi = latest.clone();
            fi.erasure.index = i + 1;
            if let Err(err) = disk.write_metadata("", bucket, object, fi).await {
                warn!("heal: failed to rewrite metadata on {}: {}", disk.to_string(), err);
            }
        }

        for (i, state) in result.before_drives.iter().enumerate() {
            if needs_heal[i] {
                result.after_drives.push("online".to_string());
            } else {
                result.after_drives.push(state.clone());
            }
        }

        Ok(result)
    }

    /// Streams every part once through the decoder, writing the
    /// reconstructed shard blocks for the drives being healed.
    async fn heal_erasure_shards(
        &self,
        bucket: &str,
        object: &str,
        fi: &FileInfo,
        shuffled_disks: &[Option<DiskStore>],
        needs_heal: &[bool],
    ) -> Result<()> {
        let erasure = Erasure::new(fi.erasure.data_blocks, fi.erasure.parity_blocks, fi.erasure.block_size);
        let algo = fi.erasure.get_checksum_info(1).algorithm;
        let shard_size = erasure.shard_size();
        let data_dir = fi.data_dir.map(|d| d.to_string()).unwrap_or_default();

        for part in fi.parts.iter() {
            let part_path = format!("{object}/{data_dir}/part.{}", part.number);
            let tmp_dir = Uuid::new_v4().to_string();
            let tmp_part = format!("{tmp_dir}/part.{}", part.number);

            // Open readers on the healthy drives.
            let mut readers: Vec<Option<BitrotReader>> = Vec::with_capacity(shuffled_disks.len());
            for (i, disk) in shuffled_disks.iter().enumerate() {
                if needs_heal[i] {
                    readers.push(None);
                    continue;
                }
                match disk {
                    Some(disk) => {
                        let file_size = crate::erasure_coding::bitrot_shard_file_size(
                            erasure.shard_file_size(part.size as i64) as usize,
                            shard_size,
                            &algo,
                        );
                        match disk.read_file_stream(bucket, &part_path, 0, file_size).await {
                            Ok(stream) => readers.push(Some(BitrotReader::new(stream, shard_size, algo.clone()))),
                            Err(_) => readers.push(None),
                        }
                    }
                    None => readers.push(None),
                }
            }

            // Open writers on the drives being healed.
            let mut writers: Vec<Option<BitrotWriterWrapper>> = Vec::with_capacity(shuffled_disks.len());
            for (i, disk) in shuffled_disks.iter().enumerate() {
                if !needs_heal[i] {
                    writers.push(None);
                    continue;
                }
                match disk {
                    Some(disk) => match disk.create_file("", GARNET_META_TMP_BUCKET, &tmp_part, 0).await {
                        Ok(file) => writers.push(Some(BitrotWriterWrapper::new_stream(file, algo.clone()))),
                        Err(err) => {
                            warn!("heal: failed to stage shard on {}: {}", disk.to_string(), err);
                            writers.push(None);
                        }
                    },
                    None => writers.push(None),
                }
            }

            // Walk the part stripe by stripe: read available shards,
            // reconstruct the full set, write the missing ones.
            let mut remaining = part.size;
            while remaining > 0 {
                let block_len = remaining.min(fi.erasure.block_size);
                let stripe_shard_len = garnetfs_filemeta::calc_shard_size(block_len, fi.erasure.data_blocks);

                let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(readers.len());
                let mut available = 0usize;
                for reader in readers.iter_mut() {
                    match reader {
                        Some(r) => match r.read_block(stripe_shard_len).await {
                            Ok(shard) => {
                                available += 1;
                                shards.push(Some(shard));
                            }
                            Err(_) => {
                                *reader = None;
                                shards.push(None);
                            }
                        },
                        None => shards.push(None),
                    }
                }

                if available < fi.erasure.data_blocks {
                    self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();
                    return Err(to_object_err(Error::ErasureReadQuorum, vec![bucket, object]));
                }

                erasure.heal_stripe(&mut shards).map_err(Error::from)?;

                for (i, writer) in writers.iter_mut().enumerate() {
                    if let Some(w) = writer {
                        if let Some(shard) = &shards[i] {
                            if let Err(err) = w.write(shard).await {
                                warn!("heal: shard write failed: {}", err);
                                *writer = None;
                            }
                        }
                    }
                }

                remaining -= block_len;
            }

            for writer in writers.iter_mut().flatten() {
                writer.shutdown().await.ok();
            }
            drop(writers);

            // Move healed shards into place.
            for (i, disk) in shuffled_disks.iter().enumerate() {
                if !needs_heal[i] {
                    continue;
                }
                let Some(disk) = disk else { continue };
                if let Err(err) = disk
                    .rename_file(GARNET_META_TMP_BUCKET, &tmp_part, bucket, &part_path)
                    .await
                {
                    warn!("heal: failed to commit shard on {}: {}", disk.to_string(), err);
                }
            }

            self.delete_all(GARNET_META_TMP_BUCKET, &tmp_dir).await.ok();
        }

        Ok(())
    }
}

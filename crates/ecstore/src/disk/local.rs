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

//! Local drive backed by a filesystem mount. All commits are
//! rename-into-place; deletes go through `.garnet.sys/tmp/.trash` so the
//! hot path never waits on a large tree removal.

use super::endpoint::Endpoint;
use super::error::{DiskError, Result};
use super::format::FormatV3;
use super::fs;
use super::{
    CHECK_PART_FILE_CORRUPT, CHECK_PART_FILE_NOT_FOUND, CHECK_PART_SUCCESS, CHECK_PART_VOLUME_NOT_FOUND, CheckPartsResp,
    DeleteOptions, DiskAPI, DiskInfo, DiskInfoOptions, FORMAT_CONFIG_FILE, GARNET_META_BUCKET, GARNET_META_TMP_DELETED_BUCKET,
    MetaCacheEntry, ReadMultipleReq, ReadMultipleResp, ReadOptions, RenameDataResp, STORAGE_FORMAT_FILE, UpdateMetadataOpts,
    VolumeInfo, WalkDirOptions,
};
use garnetfs_filemeta::{FileInfo, FileInfoVersions, FileMeta, RawFileInfo};
use garnetfs_utils::path::SLASH_SEPARATOR;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub struct LocalDisk {
    root: PathBuf,
    endpoint: Endpoint,
    id: RwLock<Option<Uuid>>,
}

impl LocalDisk {
    pub async fn new(ep: &Endpoint, cleanup: bool) -> Result<Self> {
        let root = ep.get_file_path();
        fs::make_dir_all(&root).await?;

        let disk = Self {
            root,
            endpoint: ep.clone(),
            id: RwLock::new(None),
        };

        // Bootstrap the system area so every later commit can rename
        // straight into place.
        for vol in [
            GARNET_META_BUCKET,
            super::GARNET_META_MULTIPART_BUCKET,
            super::GARNET_META_TMP_BUCKET,
            GARNET_META_TMP_DELETED_BUCKET,
            &format!("{GARNET_META_BUCKET}/{}", super::BUCKET_META_PREFIX),
        ] {
            fs::make_dir_all(&disk.root.join(vol)).await?;
        }

        if cleanup {
            let tmp = disk.root.join(super::GARNET_META_TMP_BUCKET);
            let _ = fs::reliable_remove_all(&tmp).await;
            fs::make_dir_all(&tmp.join(".trash")).await?;
        }

        // A pre-existing format pins the drive id.
        if let Ok(buf) = disk.read_all(GARNET_META_BUCKET, FORMAT_CONFIG_FILE).await {
            let format = FormatV3::unmarshal(&buf)?;
            *disk.id.write().await = Some(format.erasure.this);
        }

        Ok(disk)
    }

    fn check_path_component(path: &str) -> Result<()> {
        if path.split(SLASH_SEPARATOR).any(|c| c == "..") {
            return Err(DiskError::InvalidPath);
        }
        Ok(())
    }

    fn resolve_volume(&self, volume: &str) -> Result<PathBuf> {
        Self::check_path_component(volume)?;
        Ok(self.root.join(volume))
    }

    fn resolve(&self, volume: &str, path: &str) -> Result<PathBuf> {
        Self::check_path_component(volume)?;
        Self::check_path_component(path)?;
        Ok(self.root.join(volume).join(path))
    }

    async fn read_file_meta(&self, volume: &str, path: &str) -> Result<FileMeta> {
        let buf = self.read_all(volume, &format!("{path}/{STORAGE_FORMAT_FILE}")).await?;
        FileMeta::load(&buf).map_err(DiskError::from)
    }

    async fn write_file_meta(&self, volume: &str, path: &str, meta: &FileMeta) -> Result<()> {
        let buf = meta.marshal_msg().map_err(DiskError::from)?;
        self.write_all(volume, &format!("{path}/{STORAGE_FORMAT_FILE}"), buf).await
    }

    /// Parks a directory in the trash for asynchronous removal.
    async fn move_to_trash(&self, abs: &Path) -> Result<()> {
        if tokio::fs::metadata(abs).await.is_err() {
            return Ok(());
        }
        let trash = self.root.join(GARNET_META_TMP_DELETED_BUCKET).join(Uuid::new_v4().to_string());
        fs::reliable_rename(abs, &trash).await
    }

    async fn clear_trashed(&self) {
        let trash = self.root.join(GARNET_META_TMP_DELETED_BUCKET);
        if let Ok(mut rd) = tokio::fs::read_dir(&trash).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                let _ = fs::reliable_remove_all(&entry.path()).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl DiskAPI for LocalDisk {
    fn to_string(&self) -> String {
        self.root.to_string_lossy().to_string()
    }

    async fn is_online(&self) -> bool {
        fs::access(&self.root).await.is_ok()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn host_name(&self) -> String {
        "localhost".to_string()
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_disk_id(&self) -> Result<Option<Uuid>> {
        Ok(*self.id.read().await)
    }

    async fn set_disk_id(&self, id: Option<Uuid>) -> Result<()> {
        *self.id.write().await = id;
        Ok(())
    }

    fn path(&self) -> PathBuf {
        self.root.clone()
    }

    async fn make_volume(&self, volume: &str) -> Result<()> {
        let p = self.resolve_volume(volume)?;
        if fs::access(&p).await.is_ok() {
            return Err(DiskError::VolumeExists);
        }
        fs::make_dir_all(&p).await
    }

    async fn make_volumes(&self, volumes: Vec<&str>) -> Result<()> {
        for volume in volumes {
            match self.make_volume(volume).await {
                Ok(()) | Err(DiskError::VolumeExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.root).await.map_err(DiskError::from)?;
        while let Some(entry) = rd.next_entry().await.map_err(DiskError::from)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == GARNET_META_BUCKET || !entry.path().is_dir() {
                continue;
            }
            let created = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.created().ok())
                .map(OffsetDateTime::from);
            out.push(VolumeInfo { name, created });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn stat_volume(&self, volume: &str) -> Result<VolumeInfo> {
        let p = self.resolve_volume(volume)?;
        let meta = tokio::fs::metadata(&p).await.map_err(|_| DiskError::VolumeNotFound)?;
        if !meta.is_dir() {
            return Err(DiskError::VolumeNotFound);
        }
        Ok(VolumeInfo {
            name: volume.to_string(),
            created: meta.created().ok().map(OffsetDateTime::from),
        })
    }

    async fn delete_volume(&self, volume: &str) -> Result<()> {
        let p = self.resolve_volume(volume)?;
        if fs::access(&p).await.is_err() {
            return Err(DiskError::VolumeNotFound);
        }
        match tokio::fs::remove_dir(&p).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(DiskError::VolumeNotFound),
            Err(_) => Err(DiskError::VolumeNotEmpty),
        }
    }

    async fn walk_dir(&self, opts: WalkDirOptions) -> Result<Vec<MetaCacheEntry>> {
        let base = if opts.base_dir.is_empty() {
            self.resolve_volume(&opts.bucket)?
        } else {
            self.resolve(&opts.bucket, &opts.base_dir)?
        };

        if opts.report_notfound && fs::access(&base).await.is_err() {
            return Err(DiskError::FileNotFound);
        }

        let root = self.resolve_volume(&opts.bucket)?;
        let mut names = Vec::new();
        fs::walk_meta_entries(&root, &base, &mut names).await?;

        let mut out = Vec::new();
        for name in names {
            if let Some(prefix) = &opts.filter_prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(forward) = &opts.forward_to {
                if name.as_str() <= forward.as_str() {
                    continue;
                }
            }
            match self.read_all(&opts.bucket, &format!("{name}/{STORAGE_FORMAT_FILE}")).await {
                Ok(metadata) => out.push(MetaCacheEntry { name, metadata }),
                Err(DiskError::FileNotFound) => continue,
                Err(err) => {
                    warn!("walk_dir failed reading {}/{}: {}", opts.bucket, name, err);
                    continue;
                }
            }
            if opts.limit > 0 && out.len() >= opts.limit as usize {
                break;
            }
        }
        Ok(out)
    }

    async fn delete_version(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
        _force_del_marker: bool,
        _opts: DeleteOptions,
    ) -> Result<()> {
        if fi.deleted {
            // Delete marker insertion is a metadata write.
            return self.write_metadata("", volume, path, fi).await;
        }

        let mut meta = match self.read_file_meta(volume, path).await {
            Ok(meta) => meta,
            Err(DiskError::FileNotFound) if fi.version_id.is_some() => return Err(DiskError::FileVersionNotFound),
            Err(err) => return Err(err),
        };

        let old_dir = meta.delete_version(&fi).map_err(DiskError::from)?;

        if let Some(data_dir) = old_dir {
            let dir = self.resolve(volume, &format!("{path}/{data_dir}"))?;
            self.move_to_trash(&dir).await?;
        }

        let object_dir = self.resolve(volume, path)?;
        if meta.versions.is_empty() {
            self.move_to_trash(&object_dir).await?;
            fs::remove_empty_parents(object_dir, &self.resolve_volume(volume)?).await;
        } else {
            self.write_file_meta(volume, path, &meta).await?;
        }

        Ok(())
    }

    async fn delete_versions(
        &self,
        volume: &str,
        versions: Vec<FileInfoVersions>,
        opts: DeleteOptions,
    ) -> Result<Vec<Option<DiskError>>> {
        let mut errs = Vec::with_capacity(versions.len());
        for fivs in versions {
            let mut first_err = None;
            for fi in fivs.versions {
                if let Err(err) = self.delete_version(volume, &fivs.name, fi, false, opts.clone()).await {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            errs.push(first_err);
        }
        Ok(errs)
    }

    async fn write_metadata(&self, _org_volume: &str, volume: &str, path: &str, fi: FileInfo) -> Result<()> {
        let mut meta = match self.read_file_meta(volume, path).await {
            Ok(meta) => meta,
            Err(DiskError::FileNotFound) => FileMeta::new(),
            Err(err) => return Err(err),
        };
        meta.add_version(fi).map_err(DiskError::from)?;
        self.write_file_meta(volume, path, &meta).await
    }

    async fn update_metadata(&self, volume: &str, path: &str, fi: FileInfo, opts: &UpdateMetadataOpts) -> Result<()> {
        let mut meta = self.read_file_meta(volume, path).await?;

        let (idx, ver) = meta.find_version(fi.version_id).map_err(DiskError::from)?;
        let mut stored = ver.to_file_info().map_err(DiskError::from)?;
        stored.metadata = fi.metadata.clone();
        stored.replication_state_internal = fi.replication_state_internal.clone();

        let updated = garnetfs_filemeta::FileMetaShallowVersion::from_file_info(&stored).map_err(DiskError::from)?;
        meta.versions[idx] = updated;

        if opts.no_persistence {
            return Ok(());
        }
        self.write_file_meta(volume, path, &meta).await
    }

    async fn read_version(
        &self,
        _org_volume: &str,
        volume: &str,
        path: &str,
        version_id: &str,
        opts: &ReadOptions,
    ) -> Result<FileInfo> {
        let meta = self.read_file_meta(volume, path).await?;
        let vid = if version_id.is_empty() {
            None
        } else {
            Some(Uuid::parse_str(version_id).map_err(|_| DiskError::FileVersionNotFound)?)
        };
        let fi = meta.to_file_info(volume, path, vid, opts.read_data).map_err(DiskError::from)?;
        Ok(fi)
    }

    async fn read_xl(&self, volume: &str, path: &str, _read_data: bool) -> Result<RawFileInfo> {
        let buf = self.read_all(volume, &format!("{path}/{STORAGE_FORMAT_FILE}")).await?;
        Ok(RawFileInfo { buf })
    }

    async fn rename_data(
        &self,
        src_volume: &str,
        src_path: &str,
        fi: FileInfo,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<RenameDataResp> {
        let mut meta = match self.read_file_meta(dst_volume, dst_path).await {
            Ok(meta) => meta,
            Err(DiskError::FileNotFound) => FileMeta::new(),
            Err(err) => return Err(err),
        };

        // An overwrite of the same version frees its previous data dir.
        let old_data_dir = match meta.find_version(fi.version_id) {
            Ok((_, ver)) => ver.to_file_info().ok().and_then(|old| old.data_dir).filter(|d| Some(*d) != fi.data_dir),
            Err(_) => None,
        };

        if let Some(data_dir) = fi.data_dir {
            if fi.data.is_none() {
                let src = self.resolve(src_volume, &format!("{src_path}/{data_dir}"))?;
                let dst = self.resolve(dst_volume, &format!("{dst_path}/{data_dir}"))?;
                fs::reliable_rename(&src, &dst).await?;
            }
        }

        meta.add_version(fi).map_err(DiskError::from)?;
        self.write_file_meta(dst_volume, dst_path, &meta).await?;

        // Whatever is left of the staging area is garbage now.
        let src_dir = self.resolve(src_volume, src_path)?;
        let _ = self.move_to_trash(&src_dir).await;

        Ok(RenameDataResp {
            old_data_dir,
            sign: None,
        })
    }

    async fn list_dir(&self, _org_volume: &str, volume: &str, dir_path: &str, count: i32) -> Result<Vec<String>> {
        let dir = if dir_path.is_empty() {
            self.resolve_volume(volume)?
        } else {
            self.resolve(volume, dir_path)?
        };

        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(DiskError::FileNotFound),
            Err(err) => return Err(DiskError::from(err)),
        };
        while let Some(entry) = rd.next_entry().await.map_err(DiskError::from)? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() {
                name.push('/');
            }
            out.push(name);
            if count > 0 && out.len() >= count as usize {
                break;
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_file_stream(
        &self,
        volume: &str,
        path: &str,
        offset: usize,
        length: usize,
    ) -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>> {
        let p = self.resolve(volume, path)?;
        let mut file = tokio::fs::File::open(&p).await.map_err(DiskError::from)?;

        let meta = file.metadata().await.map_err(DiskError::from)?;
        if (meta.len() as usize) < offset + length {
            return Err(DiskError::FileCorrupt);
        }

        file.seek(SeekFrom::Start(offset as u64)).await.map_err(DiskError::from)?;
        Ok(Box::new(file.take(length as u64)))
    }

    async fn append_file(&self, volume: &str, path: &str) -> Result<Box<dyn AsyncWrite + Send + Sync + Unpin>> {
        let p = self.resolve(volume, path)?;
        if let Some(parent) = p.parent() {
            fs::make_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&p)
            .await
            .map_err(DiskError::from)?;
        Ok(Box::new(file))
    }

    async fn create_file(
        &self,
        _org_volume: &str,
        volume: &str,
        path: &str,
        _file_size: usize,
    ) -> Result<Box<dyn AsyncWrite + Send + Sync + Unpin>> {
        let p = self.resolve(volume, path)?;
        if let Some(parent) = p.parent() {
            fs::make_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&p).await.map_err(DiskError::from)?;
        Ok(Box::new(file))
    }

    async fn rename_file(&self, src_volume: &str, src_path: &str, dst_volume: &str, dst_path: &str) -> Result<()> {
        let src = self.resolve(src_volume, src_path)?;
        let dst = self.resolve(dst_volume, dst_path)?;
        fs::reliable_rename(&src, &dst).await
    }

    async fn rename_part(&self, src_volume: &str, src_path: &str, dst_volume: &str, dst_path: &str, meta: Vec<u8>) -> Result<()> {
        let src = self.resolve(src_volume, src_path)?;
        let dst = self.resolve(dst_volume, dst_path)?;
        fs::reliable_rename(&src, &dst).await?;
        self.write_all(dst_volume, &format!("{dst_path}.meta"), meta).await
    }

    async fn delete(&self, volume: &str, path: &str, opt: DeleteOptions) -> Result<()> {
        let p = self.resolve(volume, path)?;

        if opt.recursive && !opt.immediate {
            self.move_to_trash(&p).await?;
        } else {
            fs::reliable_remove_all(&p).await?;
        }

        if opt.immediate {
            self.clear_trashed().await;
        }

        fs::remove_empty_parents(p, &self.resolve_volume(volume)?).await;
        Ok(())
    }

    async fn verify_file(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp> {
        let mut resp = CheckPartsResp {
            results: vec![CHECK_PART_SUCCESS; fi.parts.len()],
        };

        if self.stat_volume(volume).await.is_err() {
            resp.results = vec![CHECK_PART_VOLUME_NOT_FOUND; fi.parts.len()];
            return Ok(resp);
        }

        let Some(data_dir) = fi.data_dir else {
            return Ok(resp);
        };

        let algo = fi.erasure.get_checksum_info(1).algorithm;
        let checksum_size = algo.size();
        let shard_size = fi.erasure.shard_size();

        for (i, part) in fi.parts.iter().enumerate() {
            let part_path = self.resolve(volume, &format!("{path}/{data_dir}/part.{}", part.number))?;
            let buf = match tokio::fs::read(&part_path).await {
                Ok(buf) => buf,
                Err(_) => {
                    resp.results[i] = CHECK_PART_FILE_NOT_FOUND;
                    continue;
                }
            };

            // Each block is a checksum tail followed by shard bytes.
            let mut off = 0usize;
            let mut ok = true;
            while off < buf.len() {
                if off + checksum_size > buf.len() {
                    ok = false;
                    break;
                }
                let want = &buf[off..off + checksum_size];
                let end = (off + checksum_size + shard_size).min(buf.len());
                let got = algo.hash_encode(&buf[off + checksum_size..end]);
                if want != got.as_slice() {
                    ok = false;
                    break;
                }
                off = end;
            }
            if !ok {
                resp.results[i] = CHECK_PART_FILE_CORRUPT;
            }
        }

        Ok(resp)
    }

    async fn check_parts(&self, volume: &str, path: &str, fi: &FileInfo) -> Result<CheckPartsResp> {
        let mut resp = CheckPartsResp {
            results: vec![CHECK_PART_SUCCESS; fi.parts.len()],
        };

        if self.stat_volume(volume).await.is_err() {
            resp.results = vec![CHECK_PART_VOLUME_NOT_FOUND; fi.parts.len()];
            return Ok(resp);
        }

        let Some(data_dir) = fi.data_dir else {
            return Ok(resp);
        };

        for (i, part) in fi.parts.iter().enumerate() {
            let part_path = self.resolve(volume, &format!("{path}/{data_dir}/part.{}", part.number))?;
            match tokio::fs::metadata(&part_path).await {
                Ok(meta) => {
                    let want = fi.erasure.shard_file_size(part.size as i64);
                    if want >= 0 && (meta.len() as i64) < want {
                        resp.results[i] = CHECK_PART_FILE_CORRUPT;
                    }
                }
                Err(_) => resp.results[i] = CHECK_PART_FILE_NOT_FOUND,
            }
        }

        Ok(resp)
    }

    async fn read_multiple(&self, req: ReadMultipleReq) -> Result<Vec<ReadMultipleResp>> {
        let mut out = Vec::with_capacity(req.files.len());
        let mut found = 0usize;
        for file in &req.files {
            let path = if req.prefix.is_empty() {
                file.clone()
            } else {
                format!("{}/{}", req.prefix, file)
            };

            let mut resp = ReadMultipleResp {
                bucket: req.bucket.clone(),
                prefix: req.prefix.clone(),
                file: file.clone(),
                ..Default::default()
            };

            match self.read_all(&req.bucket, &path).await {
                Ok(data) => {
                    if req.max_size > 0 && data.len() > req.max_size {
                        resp.error = DiskError::FileCorrupt.to_string();
                    } else {
                        resp.exists = true;
                        resp.mod_time = tokio::fs::metadata(self.resolve(&req.bucket, &path)?)
                            .await
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .map(OffsetDateTime::from);
                        resp.data = data;
                        found += 1;
                    }
                }
                Err(err) => {
                    if req.abort404 && err == DiskError::FileNotFound {
                        out.push(resp);
                        return Ok(out);
                    }
                    resp.error = err.to_string();
                }
            }

            out.push(resp);
            if req.max_results > 0 && found >= req.max_results {
                break;
            }
        }
        Ok(out)
    }

    async fn write_all(&self, volume: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let p = self.resolve(volume, path)?;
        fs::write_all_atomic(&p, &data).await
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>> {
        let p = self.resolve(volume, path)?;
        tokio::fs::read(&p).await.map_err(DiskError::from)
    }

    async fn disk_info(&self, _opts: &DiskInfoOptions) -> Result<DiskInfo> {
        let id = self.get_disk_id().await?.map(|u| u.to_string()).unwrap_or_default();
        let (total, free) = disk_space(&self.root);
        Ok(DiskInfo {
            total,
            free,
            used: total.saturating_sub(free),
            endpoint: self.endpoint.to_string(),
            mount_path: self.root.to_string_lossy().to_string(),
            id,
            ..Default::default()
        })
    }
}

#[cfg(unix)]
fn disk_space(path: &Path) -> (u64, u64) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return (0, 0);
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if ret != 0 {
        return (0, 0);
    }
    let frsize = stat.f_frsize as u64;
    (stat.f_blocks as u64 * frsize, stat.f_bavail as u64 * frsize)
}

#[cfg(not(unix))]
fn disk_space(_path: &Path) -> (u64, u64) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_disk() -> (tempfile::TempDir, LocalDisk) {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::new_local(dir.path().to_str().unwrap());
        let disk = LocalDisk::new(&ep, true).await.unwrap();
        (dir, disk)
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let (_dir, disk) = new_disk().await;
        disk.make_volume("bucket").await.unwrap();
        assert!(matches!(disk.make_volume("bucket").await, Err(DiskError::VolumeExists)));
        assert_eq!(disk.stat_volume("bucket").await.unwrap().name, "bucket");
        disk.delete_volume("bucket").await.unwrap();
        assert!(matches!(disk.stat_volume("bucket").await, Err(DiskError::VolumeNotFound)));
    }

    #[tokio::test]
    async fn test_metadata_write_and_read_version() {
        let (_dir, disk) = new_disk().await;
        disk.make_volume("bucket").await.unwrap();

        let mut fi = FileInfo::new("bucket/obj", 2, 2);
        fi.volume = "bucket".to_string();
        fi.name = "obj".to_string();
        fi.version_id = Some(Uuid::new_v4());
        fi.mod_time = Some(OffsetDateTime::now_utc());
        fi.erasure.index = 1;

        disk.write_metadata("", "bucket", "obj", fi.clone()).await.unwrap();

        let got = disk
            .read_version("", "bucket", "obj", &fi.version_id.unwrap().to_string(), &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(got.version_id, fi.version_id);
        assert!(got.is_latest);

        let raw = disk.read_xl("bucket", "obj", false).await.unwrap();
        assert!(FileMeta::is_xl2_format(&raw.buf));
    }

    #[tokio::test]
    async fn test_delete_version_removes_object_dir() {
        let (_dir, disk) = new_disk().await;
        disk.make_volume("bucket").await.unwrap();

        let mut fi = FileInfo::new("bucket/obj", 2, 2);
        fi.version_id = Some(Uuid::new_v4());
        fi.mod_time = Some(OffsetDateTime::now_utc());
        disk.write_metadata("", "bucket", "obj", fi.clone()).await.unwrap();

        disk.delete_version("bucket", "obj", fi, false, DeleteOptions::default())
            .await
            .unwrap();
        assert!(matches!(disk.read_xl("bucket", "obj", false).await, Err(DiskError::FileNotFound)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, disk) = new_disk().await;
        assert!(matches!(disk.read_all("bucket", "../escape").await, Err(DiskError::InvalidPath)));
    }

    #[tokio::test]
    async fn test_walk_dir_ascending_with_forward() {
        let (_dir, disk) = new_disk().await;
        disk.make_volume("bucket").await.unwrap();
        for obj in ["c", "a", "b"] {
            let mut fi = FileInfo::new("bucket/x", 2, 2);
            fi.mod_time = Some(OffsetDateTime::now_utc());
            disk.write_metadata("", "bucket", obj, fi).await.unwrap();
        }

        let entries = disk
            .walk_dir(WalkDirOptions {
                bucket: "bucket".to_string(),
                recursive: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let entries = disk
            .walk_dir(WalkDirOptions {
                bucket: "bucket".to_string(),
                recursive: true,
                forward_to: Some("a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}

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

//! Filesystem helpers shared by the local drive implementation. All paths
//! here are absolute; the caller has already joined the drive root.

use super::error::{DiskError, Result};
use std::path::{Path, PathBuf};

pub async fn access(path: &Path) -> Result<()> {
    tokio::fs::metadata(path).await.map_err(DiskError::from)?;
    Ok(())
}

pub async fn make_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(DiskError::from)
}

/// Renames with automatic parent creation on the destination side, the
/// commit primitive every atomic write builds on.
pub async fn reliable_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if tokio::fs::metadata(parent).await.is_err() {
            tokio::fs::create_dir_all(parent).await.map_err(DiskError::from)?;
        }
    }
    tokio::fs::rename(src, dst).await.map_err(DiskError::from)
}

/// Removes a file or an entire tree, mapping NotFound to success for
/// idempotent cleanup paths.
pub async fn reliable_remove_all(path: &Path) -> Result<()> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(DiskError::from(err)),
    };

    let res = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match res {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DiskError::from(err)),
    }
}

/// Removes empty parent directories up to (not including) `stop`.
pub async fn remove_empty_parents(mut path: PathBuf, stop: &Path) {
    while let Some(parent) = path.parent() {
        if parent == stop || !parent.starts_with(stop) {
            return;
        }
        if tokio::fs::remove_dir(parent).await.is_err() {
            // Not empty or already gone.
            return;
        }
        path = parent.to_path_buf();
    }
}

/// Writes a file atomically: stage next to the target, fsync, rename.
pub async fn write_all_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(DiskError::InvalidPath);
    };
    if tokio::fs::metadata(parent).await.is_err() {
        tokio::fs::create_dir_all(parent).await.map_err(DiskError::from)?;
    }

    let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, data).await.map_err(DiskError::from)?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DiskError::from(err));
    }
    Ok(())
}

/// Recursively collects relative paths of directories that contain an
/// `xl.meta`, in lexical order.
pub fn walk_meta_entries<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut names = Vec::new();
        let mut rd = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(DiskError::from(err)),
        };
        while let Some(entry) = rd.next_entry().await.map_err(DiskError::from)? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();

        for name in names {
            let child = dir.join(&name);
            let meta = match tokio::fs::metadata(&child).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_dir() {
                continue;
            }

            if tokio::fs::metadata(child.join(super::STORAGE_FORMAT_FILE)).await.is_ok() {
                if let Ok(rel) = child.strip_prefix(root) {
                    out.push(rel.to_string_lossy().to_string());
                }
                continue;
            }

            walk_meta_entries(root, &child, out).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_all_atomic_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/file.bin");
        write_all_atomic(&path, b"payload").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");

        reliable_remove_all(&path).await.unwrap();
        reliable_remove_all(&path).await.unwrap(); // idempotent
        assert!(access(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_walk_meta_entries_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for obj in ["zed", "alpha/nested", "mid"] {
            let p = dir.path().join(obj);
            tokio::fs::create_dir_all(&p).await.unwrap();
            tokio::fs::write(p.join("xl.meta"), b"x").await.unwrap();
        }

        let mut out = Vec::new();
        walk_meta_entries(dir.path(), dir.path(), &mut out).await.unwrap();
        assert_eq!(out, vec!["alpha/nested", "mid", "zed"]);
    }
}

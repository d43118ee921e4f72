use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{RqError, RqResult};
use crate::path::RqPath;

/// A file or directory entry as reported by the raw local substrate
/// (spec §3 File/Directory Node, stripped of sync semantics).
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub path: RqPath,
    pub is_directory: bool,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_modified_at: SystemTime,
    pub read_only: bool,
}

/// A plain hierarchical file store used as LocalTree's substrate. Not
/// aware of sync semantics (spec §2 LocalRawStore).
pub struct LocalRawStore {
    root: PathBuf,
}

impl LocalRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn full_path(&self, path: &RqPath) -> PathBuf {
        self.root.join(path.as_str().trim_start_matches('/'))
    }

    pub fn exists(&self, path: &RqPath) -> bool {
        self.full_path(path).exists()
    }

    pub fn stat(&self, path: &RqPath) -> RqResult<RawEntry> {
        let full = self.full_path(path);
        let metadata = fs::metadata(&full).map_err(|e| RqError::local_io(&full, e))?;
        Ok(to_entry(path, &metadata))
    }

    pub fn open_read(&self, path: &RqPath) -> RqResult<File> {
        let full = self.full_path(path);
        File::open(&full).map_err(|e| RqError::local_io(&full, e))
    }

    pub fn create(&self, path: &RqPath) -> RqResult<File> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| RqError::local_io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| RqError::local_io(&full, e))
    }

    pub fn open_write(&self, path: &RqPath) -> RqResult<File> {
        let full = self.full_path(path);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&full)
            .map_err(|e| RqError::local_io(&full, e))
    }

    pub fn write_all(&self, path: &RqPath, bytes: &[u8]) -> RqResult<()> {
        let mut file = self.create(path)?;
        file.write_all(bytes).map_err(|e| RqError::local_io(self.full_path(path), e))
    }

    pub fn read_to_end(&self, path: &RqPath) -> RqResult<Vec<u8>> {
        let mut file = self.open_read(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| RqError::local_io(self.full_path(path), e))?;
        Ok(buf)
    }

    pub fn set_length(&self, path: &RqPath, len: u64) -> RqResult<()> {
        let file = self.open_write(path)?;
        file.set_len(len).map_err(|e| RqError::local_io(self.full_path(path), e))
    }

    pub fn delete(&self, path: &RqPath) -> RqResult<()> {
        let full = self.full_path(path);
        if full.is_dir() {
            fs::remove_dir_all(&full).map_err(|e| RqError::local_io(&full, e))
        } else if full.exists() {
            fs::remove_file(&full).map_err(|e| RqError::local_io(&full, e))
        } else {
            Err(RqError::not_found(path.to_string()))
        }
    }

    pub fn create_dir(&self, path: &RqPath) -> RqResult<()> {
        let full = self.full_path(path);
        fs::create_dir_all(&full).map_err(|e| RqError::local_io(&full, e))
    }

    pub fn remove_dir_if_empty(&self, path: &RqPath) -> RqResult<bool> {
        let full = self.full_path(path);
        if !full.exists() {
            return Ok(true);
        }
        match fs::read_dir(&full) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(false);
                }
                fs::remove_dir(&full).map_err(|e| RqError::local_io(&full, e))?;
                Ok(true)
            }
            Err(e) => Err(RqError::local_io(&full, e)),
        }
    }

    pub fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<()> {
        let old_full = self.full_path(old);
        let new_full = self.full_path(new);
        if let Some(parent) = new_full.parent() {
            fs::create_dir_all(parent).map_err(|e| RqError::local_io(parent, e))?;
        }
        fs::rename(&old_full, &new_full).map_err(|e| RqError::local_io(&old_full, e))
    }

    /// List direct children of `path` (non-recursive; callers that need
    /// recursion compose this themselves, as LocalTree/RQTree do).
    pub fn list(&self, path: &RqPath) -> RqResult<Vec<RawEntry>> {
        let full = self.full_path(path);
        if !full.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&full).map_err(|e| RqError::local_io(&full, e))? {
            let entry = entry.map_err(|e| RqError::local_io(&full, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_path = path.join(&name)?;
            let metadata = entry.metadata().map_err(|e| RqError::local_io(&full, e))?;
            out.push(to_entry(&child_path, &metadata));
        }
        Ok(out)
    }

    /// Re-read metadata for `path`, reflecting out-of-band changes made
    /// directly on disk (spec §2 `refresh`).
    pub fn refresh(&self, path: &RqPath) -> RqResult<RawEntry> {
        self.stat(path)
    }
}

fn to_entry(path: &RqPath, metadata: &fs::Metadata) -> RawEntry {
    RawEntry {
        path: path.clone(),
        is_directory: metadata.is_dir(),
        size: metadata.len(),
        created_at: metadata.created().unwrap_or(SystemTime::UNIX_EPOCH),
        last_modified_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        read_only: metadata.permissions().readonly(),
    }
}

pub fn parent_dir_for(root: &Path, path: &RqPath) -> PathBuf {
    root.join(path.parent().as_str().trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let path = RqPath::new("/a/b.txt").unwrap();
        store.write_all(&path, b"hello").unwrap();
        assert_eq!(store.read_to_end(&path).unwrap(), b"hello");
    }

    #[test]
    fn list_reflects_children() {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        store.write_all(&RqPath::new("/dir/a").unwrap(), b"1").unwrap();
        store.write_all(&RqPath::new("/dir/b").unwrap(), b"2").unwrap();
        let entries = store.list(&RqPath::new("/dir").unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn rename_moves_content() {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let old = RqPath::new("/old").unwrap();
        let new = RqPath::new("/new").unwrap();
        store.write_all(&old, b"data").unwrap();
        store.rename(&old, &new).unwrap();
        assert!(!store.exists(&old));
        assert_eq!(store.read_to_end(&new).unwrap(), b"data");
    }

    #[test]
    fn remove_dir_if_empty_respects_contents() {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let d = RqPath::new("/d").unwrap();
        store.create_dir(&d).unwrap();
        store.write_all(&RqPath::new("/d/f").unwrap(), b"x").unwrap();
        assert!(!store.remove_dir_if_empty(&d).unwrap());
        store.delete(&RqPath::new("/d/f").unwrap()).unwrap();
        assert!(store.remove_dir_if_empty(&d).unwrap());
    }
}

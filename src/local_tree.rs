use std::sync::Arc;
use std::time::SystemTime;

use crate::error::RqResult;
use crate::metadata::{CacheInfo, RemoteInfo, WorkTree};
use crate::path::{is_temp_name, RqPath};
use crate::raw_store::{LocalRawStore, RawEntry};
use crate::remote_tree::RemoteTree;

/// A file view enriched with sidecar-derived sync attributes (spec §4.3).
///
/// In "info-only" mode (spec §9) `write`/`set_length`/`flush` are no-ops:
/// content travels straight to the remote and the cache stores only
/// metadata.
pub struct LocalFile {
    pub path: RqPath,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_modified_at: SystemTime,
    pub last_accessed_at: SystemTime,
    pub created_locally: bool,
    pub read_only: bool,
    info_only: bool,
}

impl LocalFile {
    pub fn read(&self, store: &LocalRawStore) -> RqResult<Vec<u8>> {
        store.read_to_end(&self.path)
    }

    pub fn write(&self, store: &LocalRawStore, bytes: &[u8]) -> RqResult<()> {
        if self.info_only {
            return Ok(());
        }
        store.write_all(&self.path, bytes)
    }

    pub fn set_length(&self, store: &LocalRawStore, len: u64) -> RqResult<()> {
        if self.info_only {
            return Ok(());
        }
        store.set_length(&self.path, len)
    }

    pub fn flush(&self, _store: &LocalRawStore) -> RqResult<()> {
        // content streams are unbuffered at this layer; flush is a no-op
        // even outside info-only mode, kept for symmetry with the
        // client-facing API of spec §6.
        Ok(())
    }
}

/// Wraps [`LocalRawStore`] + [`WorkTree`], presenting files enriched
/// with sidecar-derived attributes (spec §4.3).
pub struct LocalTree {
    store: LocalRawStore,
    work: Arc<WorkTree>,
    info_only: bool,
}

impl LocalTree {
    pub fn new(store: LocalRawStore, work: Arc<WorkTree>, info_only: bool) -> Self {
        Self {
            store,
            work,
            info_only,
        }
    }

    pub fn store(&self) -> &LocalRawStore {
        &self.store
    }

    pub fn work(&self) -> &WorkTree {
        &self.work
    }

    pub fn is_info_only(&self) -> bool {
        self.info_only
    }

    pub fn exists(&self, path: &RqPath) -> bool {
        if self.info_only {
            return self.work.has_sidecar(path);
        }
        self.store.exists(path)
    }

    fn to_local_file(&self, raw: &RawEntry) -> RqResult<LocalFile> {
        let created_locally = self.work.is_created_locally(&raw.path);
        let last_modified_at = match self.work.read_sidecar(&raw.path) {
            Ok(info) => self.work.effective_last_modified(&info, raw.last_modified_at),
            Err(_) => raw.last_modified_at,
        };
        Ok(LocalFile {
            path: raw.path.clone(),
            size: raw.size,
            created_at: raw.created_at,
            last_modified_at,
            last_accessed_at: raw.last_modified_at,
            created_locally,
            read_only: raw.read_only,
            info_only: self.info_only,
        })
    }

    /// Open `path` as an enriched [`LocalFile`]. If its sidecar is
    /// missing (and the content exists), it is repaired as a fresh,
    /// non-local-created cache entry (spec §7) — the caller is
    /// responsible for emitting the accompanying `syncconflict` event.
    pub fn open(&self, path: &RqPath) -> RqResult<(LocalFile, bool)> {
        let raw = self.store.stat(path)?;
        let repaired = if !is_temp_name(path.name()) && !self.work.has_sidecar(path) {
            self.work.create_sidecar(path, false, None, false, raw.last_modified_at)?;
            true
        } else {
            false
        };
        Ok((self.to_local_file(&raw)?, repaired))
    }

    pub fn create_file(&self, path: &RqPath) -> RqResult<LocalFile> {
        self.store.create(path)?;
        let raw = self.store.stat(path)?;
        if !is_temp_name(path.name()) {
            self.work.create_sidecar(path, true, None, false, raw.last_modified_at)?;
        }
        self.to_local_file(&raw)
    }

    /// Wrap an already-open content file (its bytes already written by
    /// the caller) as a [`LocalFile`], producing or refreshing its
    /// sidecar accordingly (spec §4.3 `createFromSource`).
    pub fn create_from_source(
        &self,
        path: &RqPath,
        remote: Option<RemoteInfo>,
        is_created: bool,
    ) -> RqResult<LocalFile> {
        let raw = self.store.stat(path)?;
        if !is_temp_name(path.name()) {
            if self.work.has_sidecar(path) {
                if let Some(remote) = remote {
                    self.work.refresh_sidecar(path, remote, raw.last_modified_at)?;
                } else {
                    self.work.delete_sidecar(path)?;
                    self.work.create_sidecar(path, is_created, None, false, raw.last_modified_at)?;
                }
            } else {
                self.work.create_sidecar(path, is_created, remote, false, raw.last_modified_at)?;
            }
        }
        self.to_local_file(&raw)
    }

    /// List raw entries under `path`, omitting the reserved sidecar
    /// directory, as [`LocalFile`] views.
    pub fn list(&self, path: &RqPath) -> RqResult<Vec<LocalFile>> {
        let sidecar_dir = self.work.sidecar_dir_for(path);
        let mut out = Vec::new();
        for raw in self.store.list(path)? {
            let full = self.store.full_path(&raw.path);
            if full == sidecar_dir {
                continue;
            }
            out.push(self.to_local_file(&raw)?);
        }
        Ok(out)
    }

    pub fn delete(&self, path: &RqPath) -> RqResult<()> {
        self.store.delete(path)?;
        self.work.delete_sidecar(path)?;
        Ok(())
    }

    /// Remove a directory: if non-empty, the caller must recurse first
    /// (spec §4.3 `deleteDirectory` delegates then). Removes the
    /// sidecar directory before the directory itself.
    pub fn delete_directory(&self, path: &RqPath) -> RqResult<bool> {
        let sidecar_dir = self.work.sidecar_dir_for(path);
        if sidecar_dir.exists() {
            std::fs::remove_dir_all(&sidecar_dir).ok();
        }
        self.store.remove_dir_if_empty(path)
    }

    /// Rename content and sidecars together. If `new_remote` is given,
    /// the destination is treated as overwriting a remote-known path
    /// and is therefore not `created` locally (spec §4.3 `renameExt`).
    pub fn rename_ext(
        &self,
        old: &RqPath,
        new: &RqPath,
        new_remote: Option<RemoteInfo>,
    ) -> RqResult<LocalFile> {
        self.store.rename(old, new)?;
        let raw = self.store.stat(new)?;
        self.work.rename_sidecar(old, new, new_remote, raw.last_modified_at)?;
        self.to_local_file(&raw)
    }

    pub fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<LocalFile> {
        self.rename_ext(old, new, None)
    }

    /// The safe-to-discard-cache predicate of spec §4.3: true for
    /// directories, temp files, or a non-local-created file whose
    /// sidecar's `local.lastModified` still matches the content's
    /// current timestamp and which has a recorded `remote.lastModified`.
    pub fn can_delete(&self, file: &LocalFile, raw: &RawEntry) -> bool {
        if raw.is_directory || is_temp_name(file.path.name()) {
            return true;
        }
        match self.work.read_sidecar(&file.path) {
            Ok(info) => {
                !info.created
                    && info.local_last_modified == raw.last_modified_at
                    && info.remote.is_some()
            }
            Err(_) => false,
        }
    }

    /// Compatibility variant (spec §9, second `canDelete` formulation):
    /// `(content.lastModified - lastSynced) <= modifiedThreshold && !createdLocally`.
    pub fn can_delete_within_threshold(
        &self,
        file: &LocalFile,
        raw: &RawEntry,
        threshold: std::time::Duration,
    ) -> bool {
        if raw.is_directory || is_temp_name(file.path.name()) {
            return true;
        }
        match self.work.read_sidecar(&file.path) {
            Ok(info) if !info.created => raw
                .last_modified_at
                .duration_since(info.synced)
                .map(|delta| delta <= threshold)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Fetch `path` from `remote`, materializing it locally. Sets the
    /// download marker before the fetch and clears it (waking waiters)
    /// after, regardless of outcome (spec §4.3 `download`).
    pub fn download(&self, remote: &dyn RemoteTree, path: &RqPath) -> RqResult<LocalFile> {
        self.work.set_downloading(path, true)?;
        let result = self.download_inner(remote, path);
        self.work.set_downloading(path, false)?;
        result
    }

    fn download_inner(&self, remote: &dyn RemoteTree, path: &RqPath) -> RqResult<LocalFile> {
        let bytes = remote.read_to_end(path)?;
        self.store.write_all(path, &bytes)?;
        let node = remote.stat(path)?;
        let remote_info = RemoteInfo {
            last_modified: node.last_modified_at,
            created: node.created_at,
        };
        self.create_from_source(path, Some(remote_info), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DEFAULT_SIDECAR_DIR;
    use crate::remote_tree::InMemoryRemoteTree;
    use tempfile::tempdir;

    fn tree() -> (LocalTree, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let work = Arc::new(WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR));
        (LocalTree::new(store, work, false), dir)
    }

    #[test]
    fn create_file_marks_created_locally() {
        let (tree, _dir) = tree();
        let path = RqPath::new("/doc").unwrap();
        let file = tree.create_file(&path).unwrap();
        assert!(file.created_locally);
    }

    #[test]
    fn open_repairs_missing_sidecar() {
        let (tree, _dir) = tree();
        let path = RqPath::new("/doc").unwrap();
        tree.store().write_all(&path, b"x").unwrap();
        let (_file, repaired) = tree.open(&path).unwrap();
        assert!(repaired);
        assert!(tree.work().has_sidecar(&path));
    }

    #[test]
    fn download_sets_and_clears_marker() {
        let (tree, _dir) = tree();
        let remote = InMemoryRemoteTree::new();
        let path = RqPath::new("/big").unwrap();
        remote.seed_file(&path, b"payload");
        let file = tree.download(&remote, &path).unwrap();
        assert_eq!(file.size, 7);
        assert!(!tree.work().is_downloading(&path));
    }

    #[test]
    fn can_delete_requires_unmodified_synced_file() {
        let (tree, _dir) = tree();
        let remote = InMemoryRemoteTree::new();
        let path = RqPath::new("/r").unwrap();
        remote.seed_file(&path, b"x");
        let file = tree.download(&remote, &path).unwrap();
        let raw = tree.store().stat(&path).unwrap();
        assert!(tree.can_delete(&file, &raw));
    }

    #[test]
    fn can_delete_is_false_for_local_creation() {
        let (tree, _dir) = tree();
        let path = RqPath::new("/doc").unwrap();
        let file = tree.create_file(&path).unwrap();
        let raw = tree.store().stat(&path).unwrap();
        assert!(!tree.can_delete(&file, &raw));
    }
}

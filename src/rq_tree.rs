use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::config::ShareConfig;
use crate::error::{RqError, RqResult};
use crate::events::{EventBus, RqEvent};
use crate::list_merge::{self, LocalProbe, MergeOutcome, Source, DEFAULT_IGNORE_PATTERNS};
use crate::local_tree::LocalTree;
use crate::metadata::RemoteInfo;
use crate::path::{is_temp_name, RqPath};
use crate::queue::{Action, Method, RequestQueue};
use crate::remote_tree::RemoteTree;

/// A listed or opened entry as RQTree presents it to clients (spec §4.4
/// `RQFile`, in its read-only "just the facts" shape; see [`RQFile`] for
/// the open-handle shape).
#[derive(Clone, Debug)]
pub struct RqEntry {
    pub path: RqPath,
    pub is_directory: bool,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_modified_at: SystemTime,
    pub source: Source,
}

/// A handle onto a file `RQTree::open`/`create_file` has already
/// materialized locally (spec §4.4 `RQFile`); in "basic" (info-only)
/// mode, `write`/`set_length`/`flush` are no-ops.
pub struct RqFile<'a, R: RemoteTree> {
    tree: &'a RQTree<R>,
    path: RqPath,
}

impl<'a, R: RemoteTree> RqFile<'a, R> {
    pub fn path(&self) -> &RqPath {
        &self.path
    }

    pub fn read(&mut self) -> RqResult<Vec<u8>> {
        self.tree.local.store().read_to_end(&self.path)
    }

    pub fn write(&mut self, bytes: &[u8]) -> RqResult<()> {
        if self.tree.local.is_info_only() {
            return Ok(());
        }
        self.tree.local.store().write_all(&self.path, bytes)?;
        self.tree.on_content_modified(&self.path)
    }

    pub fn set_length(&mut self, len: u64) -> RqResult<()> {
        if self.tree.local.is_info_only() {
            return Ok(());
        }
        self.tree.local.store().set_length(&self.path, len)?;
        self.tree.on_content_modified(&self.path)
    }

    pub fn flush(&mut self) -> RqResult<()> {
        Ok(())
    }
}

struct ListCacheEntry {
    at: Instant,
    entries: Vec<RqEntry>,
}

/// Top-level tree presented to clients (spec §4.4). Orchestrates
/// [`LocalTree`], the `WorkTree` sidecar store (reached through
/// `LocalTree`) and a [`RemoteTree`]; drives [`RequestQueue`] on every
/// mutation; emits sync/conflict events; owns a short-lived
/// directory-listing cache.
pub struct RQTree<R: RemoteTree> {
    local: Arc<LocalTree>,
    remote: Arc<R>,
    queue: Arc<RequestQueue>,
    events: EventBus,
    config: ShareConfig,
    list_cache: Mutex<HashMap<RqPath, ListCacheEntry>>,
    path_locks: Mutex<HashMap<RqPath, Arc<Mutex<()>>>>,
}

impl<R: RemoteTree> RQTree<R> {
    pub fn new(
        local: Arc<LocalTree>,
        remote: Arc<R>,
        queue: Arc<RequestQueue>,
        events: EventBus,
        config: ShareConfig,
    ) -> Self {
        Self {
            local,
            remote,
            queue,
            events,
            config,
            list_cache: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &RqPath) -> Arc<Mutex<()>> {
        let mut table = self.path_locks.lock();
        table.entry(path.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn invalidate_listing(&self, parent: &RqPath) {
        self.list_cache.lock().remove(parent);
    }

    fn remote_prefix(&self) -> RqPath {
        RqPath::root()
    }

    fn local_prefix(&self) -> std::path::PathBuf {
        self.config.local_path.clone()
    }

    /// `exists` per spec §4.4: local presence wins, temp files are
    /// never remote, a queued DELETE hides a remote node.
    pub fn exists(&self, path: &RqPath) -> RqResult<bool> {
        if self.local.exists(path) {
            return Ok(true);
        }
        if is_temp_name(path.name()) {
            return Ok(false);
        }
        if matches!(self.queue.get_requests(&path.parent()).get(path.name()), Some(Method::Delete)) {
            return Ok(false);
        }
        self.remote.exists(path)
    }

    /// Materialize `path` locally: downloads from the remote, coordinating
    /// with any other in-flight download via the work tree's waiter
    /// protocol (spec §4.3 `download`, §8 scenario 7).
    fn materialize(&self, path: &RqPath) -> RqResult<()> {
        let guard = self.lock_for(path);
        let _held = guard.lock();
        if self.local.exists(path) && !self.local.work().is_downloading(path) {
            return Ok(());
        }
        self.local.download(self.remote.as_ref(), path)?;
        Ok(())
    }

    /// `open` per spec §4.4: local-and-not-downloading opens locally;
    /// otherwise temp names 404, everything else is fetched into the
    /// cache via `materialize` (download marker + waiter coordination,
    /// so a second concurrent open waits for the first's fetch instead
    /// of starting its own — spec §4.3 `download`, §8 scenario 7) before
    /// opening locally.
    pub fn open(&self, path: &RqPath) -> RqResult<RqFile<'_, R>> {
        let already_local = self.local.exists(path) && !self.local.work().is_downloading(path);
        if !already_local {
            if is_temp_name(path.name()) {
                return Err(RqError::not_found(path.to_string()));
            }
            self.materialize(path)?;
        }

        let (_file, repaired) = self.local.open(path)?;
        if repaired {
            self.events.emit(RqEvent::SyncConflict { path: path.clone() });
        }
        Ok(RqFile {
            tree: self,
            path: path.clone(),
        })
    }

    fn on_content_modified(&self, path: &RqPath) -> RqResult<()> {
        self.queue.queue_request(
            Action::Post,
            &path.parent(),
            path.name(),
            self.local_prefix(),
            self.remote_prefix(),
        )
    }

    /// `createFile` per spec §4.4: delegate to LocalTree, invalidate the
    /// parent listing, enqueue PUT.
    pub fn create_file(&self, path: &RqPath) -> RqResult<RqFile<'_, R>> {
        let guard = self.lock_for(path);
        let _held = guard.lock();
        self.local.create_file(path)?;
        drop(_held);
        self.invalidate_listing(&path.parent());
        if !is_temp_name(path.name()) {
            self.queue.queue_request(
                Action::Put,
                &path.parent(),
                path.name(),
                self.local_prefix(),
                self.remote_prefix(),
            )?;
        }
        Ok(RqFile {
            tree: self,
            path: path.clone(),
        })
    }

    pub fn create_directory(&self, path: &RqPath) -> RqResult<()> {
        let guard = self.lock_for(path);
        let _held = guard.lock();
        self.local.store().create_dir(path)?;
        if !is_temp_name(path.name()) {
            self.remote.create_directory(path)?;
        }
        drop(_held);
        self.invalidate_listing(&path.parent());
        Ok(())
    }

    /// `delete` per spec §4.4: enqueue DELETE iff the file had already
    /// been synchronized, or the queue already holds a record for it;
    /// temp deletes never touch the queue.
    pub fn delete(&self, path: &RqPath) -> RqResult<()> {
        let guard = self.lock_for(path);
        let _held = guard.lock();
        let temp = is_temp_name(path.name());

        if self.local.exists(path) {
            let had_queue_record = self.queue.exists(&path.parent(), path.name());
            let was_synced = self
                .local
                .work()
                .read_sidecar(path)
                .map(|info| !info.created)
                .unwrap_or(false);
            self.local.delete(path)?;
            drop(_held);
            self.invalidate_listing(&path.parent());
            if !temp && (was_synced || had_queue_record) {
                self.queue.queue_request(
                    Action::Delete,
                    &path.parent(),
                    path.name(),
                    self.local_prefix(),
                    self.remote_prefix(),
                )?;
            }
            return Ok(());
        }

        drop(_held);
        if !temp {
            self.queue.queue_request(
                Action::Delete,
                &path.parent(),
                path.name(),
                self.local_prefix(),
                self.remote_prefix(),
            )?;
        }
        self.invalidate_listing(&path.parent());
        Ok(())
    }

    pub fn delete_directory(&self, path: &RqPath) -> RqResult<()> {
        let guard = self.lock_for(path);
        let _held = guard.lock();
        if self.local.exists(path) {
            self.delete_local_tree_recursive(path)?;
        }
        if !is_temp_name(path.name()) {
            let _ = self.remote.delete(path);
        }
        drop(_held);
        self.queue.remove_path(path)?;
        self.invalidate_listing(&path.parent());
        Ok(())
    }

    fn delete_local_tree_recursive(&self, path: &RqPath) -> RqResult<()> {
        for child in self.local.list(path)? {
            let raw = self.local.store().stat(&child.path)?;
            if raw.is_directory {
                self.delete_local_tree_recursive(&child.path)?;
            } else {
                self.local.delete(&child.path)?;
            }
        }
        self.local.delete_directory(path)?;
        Ok(())
    }

    /// `rename` per spec §4.6.
    pub fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<()> {
        let old_temp = is_temp_name(old.name());
        let new_temp = is_temp_name(new.name());

        if old_temp && new_temp {
            return Ok(());
        }

        if !old_temp && new_temp {
            let guard = self.lock_for(old);
            let _held = guard.lock();
            let had_queue_record = self.queue.exists(&old.parent(), old.name());
            let was_synced = self
                .local
                .work()
                .read_sidecar(old)
                .map(|info| !info.created)
                .unwrap_or(false);
            self.local.delete(old)?;
            drop(_held);
            self.invalidate_listing(&old.parent());
            if was_synced || had_queue_record {
                self.queue.queue_request(
                    Action::Delete,
                    &old.parent(),
                    old.name(),
                    self.local_prefix(),
                    self.remote_prefix(),
                )?;
            }
            return Ok(());
        }

        if old_temp && !new_temp {
            // Treat as a create at `new`: PUT, or POST if the target
            // already exists remotely (editor-style temp-to-real save).
            let guard = self.lock_for(old);
            let _held = guard.lock();
            let target_exists_remotely = self.remote.exists(new).unwrap_or(false);
            self.local.rename(old, new)?;
            drop(_held);
            self.invalidate_listing(&old.parent());
            self.invalidate_listing(&new.parent());
            let method = if target_exists_remotely { Action::Post } else { Action::Put };
            self.queue.queue_request(
                method,
                &new.parent(),
                new.name(),
                self.local_prefix(),
                self.remote_prefix(),
            )?;
            return Ok(());
        }

        // both non-temp
        if self.local.exists(old) {
            let guard = self.lock_for(old);
            let _held = guard.lock();
            let target_already_existed = self.exists(new)?;
            let raw = self.local.store().stat(old)?;
            self.local.rename_ext(old, new, None)?;
            drop(_held);
            self.invalidate_listing(&old.parent());
            self.invalidate_listing(&new.parent());

            if raw.is_directory {
                if self.remote.rename(old, new).is_ok() {
                    self.queue.update_path(old, new)?;
                }
            } else {
                self.queue.queue_request(
                    Action::Move {
                        dest_path: new.parent(),
                        dest_name: new.name().to_string(),
                        replace: target_already_existed,
                    },
                    &old.parent(),
                    old.name(),
                    self.local_prefix(),
                    self.remote_prefix(),
                )?;
            }
            return Ok(());
        }

        if self.remote.exists(old).unwrap_or(false) {
            self.remote.rename(old, new)?;
            return Ok(());
        }

        Err(RqError::not_found(old.to_string()))
    }

    /// `list` per spec §4.4/§4.5.
    pub fn list(&self, dir: &RqPath) -> RqResult<Vec<RqEntry>> {
        if let Some(cached) = self.list_cache.lock().get(dir) {
            if cached.at.elapsed() < Duration::from_millis(self.config.list_cache_ttl_millis) {
                return Ok(cached.entries.clone());
            }
        }

        let remote_nodes = self.remote.list(dir).unwrap_or_default();
        let remote_paths: Vec<RqPath> = remote_nodes.iter().map(|n| n.path.clone()).collect();
        let remote_by_path: HashMap<RqPath, _> =
            remote_nodes.into_iter().map(|n| (n.path.clone(), n)).collect();

        let queue_requests = self.queue.get_requests(dir);
        let q_exists_locally = self.local.exists(dir);

        let local_files = if q_exists_locally { self.local.list(dir)? } else { Vec::new() };
        let mut local_raw = HashMap::new();
        let mut probes = Vec::with_capacity(local_files.len());
        for file in &local_files {
            let raw = self.local.store().stat(&file.path)?;
            let probe = LocalProbe {
                path: file.path.clone(),
                is_temp: is_temp_name(file.path.name()),
                created_locally: file.created_locally,
                can_delete: self.local.can_delete(file, &raw),
            };
            local_raw.insert(file.path.clone(), raw);
            probes.push(probe);
        }

        let MergeOutcome {
            entries,
            conflicts,
            evictions,
        } = list_merge::merge(&remote_paths, &queue_requests, q_exists_locally, &probes, DEFAULT_IGNORE_PATTERNS);

        for evicted in &evictions {
            let _ = self.delete_local_quietly(evicted);
        }
        for conflict in &conflicts {
            self.events.emit(RqEvent::SyncConflict { path: conflict.clone() });
        }

        let mut rendered = Vec::with_capacity(entries.len());
        for entry in entries {
            let rq_entry = match entry.source {
                Source::Remote => {
                    let node = remote_by_path.get(&entry.path).expect("remote entry present");
                    RqEntry {
                        path: entry.path,
                        is_directory: node.is_directory,
                        size: node.size,
                        created_at: node.created_at,
                        last_modified_at: node.last_modified_at,
                        source: Source::Remote,
                    }
                }
                Source::Local => {
                    let raw = local_raw.get(&entry.path).cloned();
                    let raw = match raw {
                        Some(raw) => raw,
                        None => self.local.store().stat(&entry.path)?,
                    };
                    RqEntry {
                        path: entry.path,
                        is_directory: raw.is_directory,
                        size: raw.size,
                        created_at: raw.created_at,
                        last_modified_at: raw.last_modified_at,
                        source: Source::Local,
                    }
                }
            };
            rendered.push(rq_entry);
        }

        self.list_cache.lock().insert(
            dir.clone(),
            ListCacheEntry {
                at: Instant::now(),
                entries: rendered.clone(),
            },
        );
        Ok(rendered)
    }

    fn delete_local_quietly(&self, path: &RqPath) -> RqResult<()> {
        let raw = self.local.store().stat(path)?;
        if raw.is_directory {
            self.delete_local_tree_recursive(path)
        } else {
            self.local.delete(path)
        }
    }

    /// Single-item lookup: local wins; else non-temp + no queued DELETE
    /// falls through to the remote; otherwise empty (spec §4.5).
    pub fn stat(&self, path: &RqPath) -> RqResult<Option<RqEntry>> {
        if self.local.exists(path) {
            let raw = self.local.store().stat(path)?;
            return Ok(Some(RqEntry {
                path: path.clone(),
                is_directory: raw.is_directory,
                size: raw.size,
                created_at: raw.created_at,
                last_modified_at: raw.last_modified_at,
                source: Source::Local,
            }));
        }
        if is_temp_name(path.name()) {
            return Ok(None);
        }
        if matches!(self.queue.get_requests(&path.parent()).get(path.name()), Some(Method::Delete)) {
            return Ok(None);
        }
        match self.remote.stat(path) {
            Ok(node) => Ok(Some(RqEntry {
                path: path.clone(),
                is_directory: node.is_directory,
                size: node.size,
                created_at: node.created_at,
                last_modified_at: node.last_modified_at,
                source: Source::Remote,
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn disconnect(&self) {
        self.list_cache.lock().clear();
    }

    pub(crate) fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub(crate) fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub(crate) fn local(&self) -> &Arc<LocalTree> {
        &self.local
    }
}

/// Resolve the `RemoteInfo` half of a downloaded-node, used when the
/// Processor refreshes a sidecar after an upload completes.
pub fn remote_info_from(last_modified_at: SystemTime, created_at: SystemTime) -> RemoteInfo {
    RemoteInfo {
        last_modified: last_modified_at,
        created: created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{WorkTree, DEFAULT_SIDECAR_DIR};
    use crate::raw_store::LocalRawStore;
    use crate::remote_tree::InMemoryRemoteTree;
    use tempfile::tempdir;

    fn build() -> (RQTree<InMemoryRemoteTree>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let work = Arc::new(WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR));
        let local = Arc::new(LocalTree::new(store, work, false));
        let remote = Arc::new(InMemoryRemoteTree::new());
        let (bus, _rx) = EventBus::new();
        let queue = Arc::new(RequestQueue::open(dir.path().join("request-queue.db"), bus.clone()).unwrap());
        let mut config = ShareConfig::default();
        config.local_path = dir.path().to_path_buf();
        let tree = RQTree::new(local, remote, queue, bus, config);
        (tree, dir)
    }

    #[test]
    fn create_then_list_includes_new_file() {
        let (tree, _dir) = build();
        let path = RqPath::new("/x").unwrap();
        tree.create_file(&path).unwrap();
        let listed = tree.list(&RqPath::root()).unwrap();
        assert!(listed.iter().any(|e| e.path == path));
        assert!(tree.queue().exists(&RqPath::root(), "x"));
    }

    #[test]
    fn create_then_delete_removes_from_listing_and_queue() {
        let (tree, _dir) = build();
        let path = RqPath::new("/x").unwrap();
        tree.create_file(&path).unwrap();
        tree.delete(&path).unwrap();
        let listed = tree.list(&RqPath::root()).unwrap();
        assert!(!listed.iter().any(|e| e.path == path));
        assert!(!tree.queue().exists(&RqPath::root(), "x"));
    }

    #[test]
    fn remote_only_listing_has_no_sidecars() {
        let (tree, _dir) = build();
        tree.remote().put(&RqPath::new("/a").unwrap(), b"1").unwrap();
        tree.remote().put(&RqPath::new("/b").unwrap(), b"2").unwrap();
        let listed = tree.list(&RqPath::root()).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn write_then_close_then_open_reads_last_bytes() {
        let (tree, _dir) = build();
        let path = RqPath::new("/doc").unwrap();
        {
            let mut file = tree.create_file(&path).unwrap();
            file.write(b"hello").unwrap();
        }
        let mut reopened = tree.open(&path).unwrap();
        assert_eq!(reopened.read().unwrap(), b"hello");
    }

    #[test]
    fn temp_to_real_rename_queues_single_put() {
        // editor-style save: write the new version to a temp name first,
        // then swap it into place (spec §4.6, §8 scenario 6).
        let (tree, _dir) = build();
        let real = RqPath::new("/doc").unwrap();
        let temp = RqPath::new("/.doc").unwrap();
        tree.create_file(&real).unwrap();
        tree.rename(&real, &temp).unwrap();
        tree.create_file(&temp).unwrap();
        tree.rename(&temp, &real).unwrap();
        assert!(tree.local().exists(&real));
        assert!(tree.queue().exists(&RqPath::root(), "doc"));
        let record = tree.queue().record_for(&RqPath::root(), "doc").unwrap();
        assert_eq!(record.method, Method::Put);
    }

    #[test]
    fn open_materializes_remote_only_file_before_any_write() {
        let (tree, _dir) = build();
        let path = RqPath::new("/r").unwrap();
        tree.remote().put(&path, b"remote-bytes").unwrap();
        let mut file = tree.open(&path).unwrap();
        // materialized onto the local tree as part of open, not deferred to write.
        assert!(tree.local().exists(&path));
        assert!(!tree.local().work().is_downloading(&path));
        assert_eq!(file.read().unwrap(), b"remote-bytes");
    }

    #[test]
    fn rename_unsynced_creation_to_temp_collapses_queued_put() {
        // a still-unsynced local creation (PUT queued) renamed to a temp
        // name should leave no stale PUT pointing at now-absent content.
        let (tree, _dir) = build();
        let real = RqPath::new("/doc").unwrap();
        let temp = RqPath::new("/.doc").unwrap();
        tree.create_file(&real).unwrap();
        assert!(tree.queue().exists(&RqPath::root(), "doc"));
        tree.rename(&real, &temp).unwrap();
        assert!(!tree.queue().exists(&RqPath::root(), "doc"));
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RqError, RqResult};
use crate::events::{EventBus, RqEvent};
use crate::path::RqPath;

/// The abstract mutation to replay against the remote (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Put,
    Post,
    Delete,
}

/// What a caller asks the queue to do with a path. MOVE and COPY are
/// never stored verbatim; they are decomposed into PUT/POST/DELETE
/// records against the source and destination keys (spec §4.1).
#[derive(Clone, Debug)]
pub enum Action {
    Put,
    Post,
    Delete,
    Move {
        dest_path: RqPath,
        dest_name: String,
        replace: bool,
    },
    Copy {
        dest_path: RqPath,
        dest_name: String,
        replace: bool,
    },
}

/// A pending mutation to replay against the remote (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueRecord {
    pub method: Method,
    pub path: RqPath,
    pub name: String,
    pub dest_path: Option<RqPath>,
    pub dest_name: Option<String>,
    pub local_prefix: PathBuf,
    pub remote_prefix: RqPath,
    pub timestamp_millis: u64,
    pub retries: u32,
    seq: u64,
}

impl QueueRecord {
    pub fn full_path(&self) -> RqPath {
        self.path.join(&self.name).unwrap_or_else(|_| self.path.clone())
    }
}

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
struct Key {
    parent: RqPath,
    name: String,
}

#[derive(Default, Serialize, Deserialize)]
struct QueueDocument {
    records: Vec<QueueRecord>,
    #[serde(default)]
    next_seq: u64,
}

/// Durable, single-writer store of pending mutations keyed by
/// `(parent_path, name)` (spec §4.1).
pub struct RequestQueue {
    store_path: PathBuf,
    state: Mutex<QueueDocument>,
    events: EventBus,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RequestQueue {
    /// Open (creating if absent) the queue document at `store_path`,
    /// the suggested `request-queue.db` file of spec §6.
    pub fn open(store_path: impl Into<PathBuf>, events: EventBus) -> RqResult<Self> {
        let store_path = store_path.into();
        let document = if store_path.exists() {
            let bytes = fs::read(&store_path).map_err(|e| RqError::local_io(&store_path, e))?;
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            QueueDocument::default()
        };
        events.emit(RqEvent::RequestQueueInit);
        Ok(Self {
            store_path,
            state: Mutex::new(document),
            events,
        })
    }

    fn persist(&self, document: &QueueDocument) -> RqResult<()> {
        let bytes = serde_json::to_vec(document)
            .map_err(|e| RqError::internal(format!("failed to serialize queue: {e}")))?;
        let tmp_path = self.store_path.with_extension("db.tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| RqError::local_io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.store_path).map_err(|e| RqError::local_io(&self.store_path, e))
    }

    /// All records whose `path == parent_path`, as name -> method.
    pub fn get_requests(&self, parent_path: &RqPath) -> HashMap<String, Method> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .filter(|r| &r.path == parent_path)
            .map(|r| (r.name.clone(), r.method))
            .collect()
    }

    pub fn exists(&self, parent_path: &RqPath, name: &str) -> bool {
        let state = self.state.lock();
        state
            .records
            .iter()
            .any(|r| &r.path == parent_path && r.name == name)
    }

    fn guard_forbidden(path: &RqPath) -> RqResult<()> {
        for component in path.as_str().trim_start_matches('/').split('/') {
            if component.starts_with('.') && !component.is_empty() {
                return Err(RqError::invalid_name(component.to_string()));
            }
        }
        Ok(())
    }

    /// Enqueue `action` for `path`/`name`, applying the collapse rules
    /// of spec §4.1. `local_prefix`/`remote_prefix` let the Processor
    /// resolve local content and remote location later.
    pub fn queue_request(
        &self,
        action: Action,
        path: &RqPath,
        name: &str,
        local_prefix: impl Into<PathBuf>,
        remote_prefix: RqPath,
    ) -> RqResult<()> {
        Self::guard_forbidden(path)?;
        let local_prefix = local_prefix.into();

        match action {
            Action::Put => self.apply_simple(path, name, Method::Put, local_prefix, remote_prefix),
            Action::Post => self.apply_simple(path, name, Method::Post, local_prefix, remote_prefix),
            Action::Delete => self.apply_simple(path, name, Method::Delete, local_prefix, remote_prefix),
            Action::Move {
                dest_path,
                dest_name,
                replace,
            } => {
                self.apply_simple(
                    path,
                    name,
                    Method::Delete,
                    local_prefix.clone(),
                    remote_prefix.clone(),
                )?;
                let dest_method = if replace { Method::Post } else { Method::Put };
                self.apply_simple(&dest_path, &dest_name, dest_method, local_prefix, remote_prefix)
            }
            Action::Copy {
                dest_path,
                dest_name,
                replace,
            } => {
                let dest_method = if replace { Method::Post } else { Method::Put };
                self.apply_simple(&dest_path, &dest_name, dest_method, local_prefix, remote_prefix)
            }
        }
    }

    /// The single-key collapse table of spec §4.1 (the `PUT/POST`,
    /// `DELETE` columns; MOVE/COPY are decomposed into two calls of
    /// this by [`Self::queue_request`]).
    fn apply_simple(
        &self,
        path: &RqPath,
        name: &str,
        new_method: Method,
        local_prefix: PathBuf,
        remote_prefix: RqPath,
    ) -> RqResult<()> {
        let mut state = self.state.lock();
        let idx = state
            .records
            .iter()
            .position(|r| &r.path == path && r.name == name);

        let full_path = path.join(name).unwrap_or_else(|_| path.clone());

        match (idx, new_method) {
            (None, Method::Put) | (None, Method::Post) => {
                self.insert_locked(&mut state, path, name, new_method, local_prefix, remote_prefix);
            }
            (None, Method::Delete) => {
                self.insert_locked(&mut state, path, name, Method::Delete, local_prefix, remote_prefix);
            }
            (Some(i), Method::Put) | (Some(i), Method::Post)
                if state.records[i].method == Method::Put
                    || state.records[i].method == Method::Post =>
            {
                state.records[i].timestamp_millis = now_millis();
                drop(state);
                self.events.emit(RqEvent::ItemUpdated { path: full_path });
                return Ok(());
            }
            (Some(i), Method::Delete) if state.records[i].method == Method::Put => {
                state.records.remove(i);
            }
            (Some(i), Method::Delete) if state.records[i].method == Method::Post => {
                state.records.remove(i);
                self.insert_locked(&mut state, path, name, Method::Delete, local_prefix, remote_prefix);
            }
            (Some(i), Method::Put) | (Some(i), Method::Post)
                if state.records[i].method == Method::Delete =>
            {
                state.records.remove(i);
                self.insert_locked(&mut state, path, name, Method::Post, local_prefix, remote_prefix);
            }
            (Some(i), Method::Delete) => {
                // cur is already Delete: keep it, bump the timestamp.
                state.records[i].timestamp_millis = now_millis();
                drop(state);
                self.events.emit(RqEvent::ItemUpdated { path: full_path });
                return Ok(());
            }
            _ => unreachable!("all (cur, new) method pairs are covered above"),
        }

        self.persist(&state)?;
        drop(state);
        self.events.emit(RqEvent::ItemUpdated { path: full_path });
        Ok(())
    }

    fn insert_locked(
        &self,
        state: &mut QueueDocument,
        path: &RqPath,
        name: &str,
        method: Method,
        local_prefix: PathBuf,
        remote_prefix: RqPath,
    ) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.push(QueueRecord {
            method,
            path: path.clone(),
            name: name.to_string(),
            dest_path: None,
            dest_name: None,
            local_prefix,
            remote_prefix,
            timestamp_millis: now_millis(),
            retries: 0,
            seq,
        });
    }

    /// The oldest record due for processing: `timestamp <= now - older_than_millis`
    /// and `retries < max_retries`, ties broken by insertion order.
    pub fn get_process_request(&self, older_than_millis: u64, max_retries: u32) -> Option<QueueRecord> {
        let state = self.state.lock();
        let threshold = now_millis().saturating_sub(older_than_millis);
        state
            .records
            .iter()
            .filter(|r| r.timestamp_millis <= threshold && r.retries < max_retries)
            .min_by_key(|r| (r.timestamp_millis, r.seq))
            .cloned()
    }

    pub fn increment_retry_count(&self, path: &RqPath, name: &str, delay_millis: u64) -> RqResult<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.path == path && r.name == name)
            .ok_or_else(|| RqError::internal("increment_retry_count: record vanished"))?;
        record.retries += 1;
        record.timestamp_millis = now_millis() + delay_millis;
        self.persist(&state)
    }

    pub fn complete_request(&self, path: &RqPath, name: &str) -> RqResult<()> {
        self.remove_silent(path, name)
    }

    pub fn remove_request(&self, path: &RqPath, name: &str) -> RqResult<()> {
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|r| !(&r.path == path && r.name == name));
        let removed = before - state.records.len();
        if removed != 1 {
            return Err(RqError::internal(format!(
                "removeRequest expected exactly one affected row, saw {removed}"
            )));
        }
        self.persist(&state)?;
        drop(state);
        let full_path = path.join(name).unwrap_or_else(|_| path.clone());
        self.events.emit(RqEvent::ItemUpdated { path: full_path });
        Ok(())
    }

    fn remove_silent(&self, path: &RqPath, name: &str) -> RqResult<()> {
        let mut state = self.state.lock();
        state.records.retain(|r| !(&r.path == path && r.name == name));
        self.persist(&state)
    }

    /// Delete and report records with `retries >= max_retries`.
    pub fn purge_failed_requests(&self, max_retries: u32) -> RqResult<Vec<RqPath>> {
        let mut state = self.state.lock();
        let (failed, retained): (Vec<_>, Vec<_>) = state
            .records
            .drain(..)
            .partition(|r| r.retries >= max_retries);
        state.records = retained;
        self.persist(&state)?;
        let purged: Vec<RqPath> = failed.iter().map(|r| r.full_path()).collect();
        drop(state);
        if !purged.is_empty() {
            self.events.emit(RqEvent::SyncPurged {
                files: purged.clone(),
            });
        }
        Ok(purged)
    }

    /// Rewrite the prefix of every record whose `path` is `old_parent`
    /// or a descendant of it, resetting `timestamp` to now.
    pub fn update_path(&self, old_parent: &RqPath, new_parent: &RqPath) -> RqResult<()> {
        let mut state = self.state.lock();
        let now = now_millis();
        let mut touched = false;
        for record in state.records.iter_mut() {
            if record.path.is_under(old_parent) {
                record.path = record.path.rebase(old_parent, new_parent);
                record.timestamp_millis = now;
                touched = true;
            }
        }
        if touched {
            self.persist(&state)?;
        }
        drop(state);
        self.events.emit(RqEvent::PathUpdated {
            parent: new_parent.clone(),
        });
        Ok(())
    }

    /// Delete every record whose `path` is `parent` or a descendant of it.
    pub fn remove_path(&self, parent: &RqPath) -> RqResult<()> {
        let mut state = self.state.lock();
        state.records.retain(|r| !r.path.is_under(parent));
        self.persist(&state)?;
        drop(state);
        self.events.emit(RqEvent::PathUpdated {
            parent: parent.clone(),
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record_for(&self, path: &RqPath, name: &str) -> Option<QueueRecord> {
        self.state
            .lock()
            .records
            .iter()
            .find(|r| &r.path == path && r.name == name)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().records.len()
    }
}

/// Helper retained for call sites that only care about the raw file
/// path backing this queue (diagnostics, tests).
pub fn default_store_path(work_path: &Path) -> PathBuf {
    work_path.join("request-queue.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_queue() -> (RequestQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let (bus, _rx) = EventBus::new();
        let queue = RequestQueue::open(default_store_path(dir.path()), bus).unwrap();
        (queue, dir)
    }

    fn remote_prefix() -> RqPath {
        RqPath::new("/remote").unwrap()
    }

    #[test]
    fn put_then_delete_collapses_to_empty() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Put, &parent, "f", "/local", remote_prefix())
            .unwrap();
        queue
            .queue_request(Action::Delete, &parent, "f", "/local", remote_prefix())
            .unwrap();
        assert!(!queue.exists(&parent, "f"));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn post_then_delete_leaves_delete() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Post, &parent, "f", "/local", remote_prefix())
            .unwrap();
        queue
            .queue_request(Action::Delete, &parent, "f", "/local", remote_prefix())
            .unwrap();
        let record = queue.record_for(&parent, "f").unwrap();
        assert_eq!(record.method, Method::Delete);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn delete_then_put_becomes_post() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Delete, &parent, "f", "/local", remote_prefix())
            .unwrap();
        queue
            .queue_request(Action::Put, &parent, "f", "/local", remote_prefix())
            .unwrap();
        let record = queue.record_for(&parent, "f").unwrap();
        assert_eq!(record.method, Method::Post);
    }

    #[test]
    fn delete_then_delete_keeps_single_delete() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Delete, &parent, "f", "/local", remote_prefix())
            .unwrap();
        queue
            .queue_request(Action::Delete, &parent, "f", "/local", remote_prefix())
            .unwrap();
        assert_eq!(queue.len(), 1);
        let record = queue.record_for(&parent, "f").unwrap();
        assert_eq!(record.method, Method::Delete);
    }

    #[test]
    fn move_decomposes_into_delete_source_and_put_dest() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        let dest = RqPath::new("/b").unwrap();
        queue
            .queue_request(Action::Put, &parent, "f", "/local", remote_prefix())
            .unwrap();
        // the PUT at src is removed (never synced), so the move just
        // becomes a PUT at the destination.
        queue
            .queue_request(
                Action::Move {
                    dest_path: dest.clone(),
                    dest_name: "g".to_string(),
                    replace: false,
                },
                &parent,
                "f",
                "/local",
                remote_prefix(),
            )
            .unwrap();
        assert!(!queue.exists(&parent, "f"));
        let dest_record = queue.record_for(&dest, "g").unwrap();
        assert_eq!(dest_record.method, Method::Put);
    }

    #[test]
    fn forbidden_dotted_parent_component_is_rejected() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/.hidden").unwrap();
        let result = queue.queue_request(Action::Put, &parent, "f", "/local", remote_prefix());
        assert!(result.is_err());
    }

    #[test]
    fn get_process_request_orders_oldest_first() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Put, &parent, "first", "/local", remote_prefix())
            .unwrap();
        queue
            .queue_request(Action::Put, &parent, "second", "/local", remote_prefix())
            .unwrap();
        let due = queue.get_process_request(0, 10).unwrap();
        assert_eq!(due.name, "first");
    }

    #[test]
    fn purge_failed_requests_removes_and_reports() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a").unwrap();
        queue
            .queue_request(Action::Put, &parent, "f", "/local", remote_prefix())
            .unwrap();
        for _ in 0..3 {
            queue.increment_retry_count(&parent, "f", 0).unwrap();
        }
        let purged = queue.purge_failed_requests(3).unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn update_path_rewrites_descendants() {
        let (queue, _dir) = open_queue();
        let parent = RqPath::new("/a/sub").unwrap();
        queue
            .queue_request(Action::Put, &parent, "f", "/local", remote_prefix())
            .unwrap();
        queue
            .update_path(&RqPath::new("/a").unwrap(), &RqPath::new("/z").unwrap())
            .unwrap();
        let record = queue.record_for(&RqPath::new("/z/sub").unwrap(), "f");
        assert!(record.is_some());
    }
}

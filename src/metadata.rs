use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RqError, RqResult};
use crate::path::RqPath;
use crate::session::{self, SessionId};

/// The reserved sidecar directory name, beside each directory it describes
/// (spec §6; configurable via [`crate::config::ShareConfig::sidecar_dir_name`]).
pub const DEFAULT_SIDECAR_DIR: &str = ".aem";

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_millis(ms)
}

mod time_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        Ok(from_millis(u64::deserialize(d)?))
    }
}

mod time_millis_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_some(&value.map(millis))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(from_millis))
    }
}

/// Known remote timestamps captured at the last sync (spec §3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RemoteInfo {
    #[serde(with = "time_millis")]
    pub last_modified: SystemTime,
    #[serde(with = "time_millis")]
    pub created: SystemTime,
}

/// One per non-temp, non-directory cached file (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(with = "time_millis")]
    pub local_last_modified: SystemTime,
    #[serde(with = "time_millis_opt", rename = "remote", default)]
    pub remote: Option<RemoteInfo>,
    pub created: bool,
    pub refreshed: bool,
    #[serde(with = "time_millis")]
    pub synced: SystemTime,
}

impl CacheInfo {
    pub fn local_created(local_last_modified: SystemTime) -> Self {
        Self {
            local_last_modified,
            remote: None,
            created: true,
            refreshed: false,
            synced: SystemTime::now(),
        }
    }

    pub fn from_remote(local_last_modified: SystemTime, remote: RemoteInfo, refreshed: bool) -> Self {
        Self {
            local_last_modified,
            remote: Some(remote),
            created: false,
            refreshed,
            synced: SystemTime::now(),
        }
    }
}

fn sidecar_path(sidecar_dir_name: &str, parent_dir: &Path, name: &str) -> PathBuf {
    parent_dir.join(sidecar_dir_name).join(format!("{name}.json"))
}

fn marker_path(sidecar_dir_name: &str, parent_dir: &Path, name: &str, session: SessionId) -> PathBuf {
    parent_dir
        .join(sidecar_dir_name)
        .join(format!("{name}.{session}.downloading"))
}

type WaitCallback = Box<dyn FnOnce() + Send>;

/// Owns the sidecars and transient download markers for every non-temp
/// file under a cache root (spec §4.2).
pub struct WorkTree {
    cache_root: PathBuf,
    sidecar_dir_name: String,
    waiters: Mutex<HashMap<PathBuf, Vec<WaitCallback>>>,
}

impl WorkTree {
    pub fn new(cache_root: impl Into<PathBuf>, sidecar_dir_name: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            sidecar_dir_name: sidecar_dir_name.into(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn full_dir(&self, path: &RqPath) -> PathBuf {
        let relative = path.as_str().trim_start_matches('/');
        self.cache_root.join(relative)
    }

    fn sidecar_file(&self, path: &RqPath) -> PathBuf {
        let parent_dir = self.full_dir(&path.parent());
        sidecar_path(&self.sidecar_dir_name, &parent_dir, path.name())
    }

    /// The reserved sidecar directory beside `dir_path`, for callers
    /// (e.g. `LocalTree::list`) that need to filter it out of listings.
    pub fn sidecar_dir_for(&self, dir_path: &RqPath) -> PathBuf {
        self.full_dir(dir_path).join(&self.sidecar_dir_name)
    }

    pub fn sidecar_dir_name(&self) -> &str {
        &self.sidecar_dir_name
    }

    /// Writes a new sidecar; fails if one already exists unless
    /// `created_locally=true` (then overwrite). `local_last_modified`
    /// must be the cached content's actual fs mtime, not wall-clock time:
    /// `can_delete` requires it to match the content's current mtime
    /// exactly (spec §8).
    pub fn create_sidecar(
        &self,
        path: &RqPath,
        created_locally: bool,
        remote_info: Option<RemoteInfo>,
        refreshed: bool,
        local_last_modified: SystemTime,
    ) -> RqResult<()> {
        let file = self.sidecar_file(path);
        if file.exists() && !created_locally {
            return Err(RqError::already_exists(path.to_string()));
        }
        let info = CacheInfo {
            local_last_modified,
            remote: remote_info,
            created: created_locally,
            refreshed,
            synced: SystemTime::now(),
        };
        self.write_sidecar(&file, &info)
    }

    fn write_sidecar(&self, file: &Path, info: &CacheInfo) -> RqResult<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|e| RqError::local_io(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(info)
            .map_err(|e| RqError::internal(format!("failed to serialize sidecar: {e}")))?;
        fs::write(file, bytes).map_err(|e| RqError::local_io(file, e))
    }

    pub fn read_sidecar(&self, path: &RqPath) -> RqResult<CacheInfo> {
        let file = self.sidecar_file(path);
        let bytes = fs::read(&file).map_err(|e| RqError::local_io(&file, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RqError::internal(format!("corrupt sidecar at {}: {e}", file.display())))
    }

    pub fn has_sidecar(&self, path: &RqPath) -> bool {
        self.sidecar_file(path).exists()
    }

    /// `local_last_modified` must be the content's actual fs mtime at
    /// the time of this refresh (see [`Self::create_sidecar`]).
    pub fn refresh_sidecar(
        &self,
        path: &RqPath,
        remote_info: RemoteInfo,
        local_last_modified: SystemTime,
    ) -> RqResult<()> {
        let file = self.sidecar_file(path);
        let info = CacheInfo {
            local_last_modified,
            remote: Some(remote_info),
            created: false,
            refreshed: true,
            synced: SystemTime::now(),
        };
        self.write_sidecar(&file, &info)
    }

    pub fn delete_sidecar(&self, path: &RqPath) -> RqResult<()> {
        let file = self.sidecar_file(path);
        if file.exists() {
            fs::remove_file(&file).map_err(|e| RqError::local_io(&file, e))?;
        }
        Ok(())
    }

    /// Rename content's sidecar from `old_path` to `new_path`. `created`
    /// is preserved only when `new_remote` is absent (a remote-known
    /// destination means the moved file is no longer a pure local
    /// creation). `local_last_modified` must be the renamed content's
    /// actual fs mtime at `new_path` (see [`Self::create_sidecar`]).
    pub fn rename_sidecar(
        &self,
        old_path: &RqPath,
        new_path: &RqPath,
        new_remote: Option<RemoteInfo>,
        local_last_modified: SystemTime,
    ) -> RqResult<()> {
        let old_info = self.read_sidecar(old_path).ok();
        self.delete_sidecar(old_path)?;
        self.delete_sidecar(new_path)?;

        let now = SystemTime::now();
        let info = match (old_info, new_remote) {
            (_, Some(remote)) => CacheInfo {
                local_last_modified,
                remote: Some(remote),
                created: false,
                refreshed: false,
                synced: now,
            },
            (Some(old), None) => CacheInfo {
                local_last_modified,
                remote: old.remote,
                created: old.created,
                refreshed: old.refreshed,
                synced: now,
            },
            (None, None) => CacheInfo::local_created(local_last_modified),
        };
        self.write_sidecar(&self.sidecar_file(new_path), &info)
    }

    pub fn is_created_locally(&self, path: &RqPath) -> bool {
        self.read_sidecar(path).map(|info| info.created).unwrap_or(false)
    }

    fn marker_file(&self, path: &RqPath, session: SessionId) -> PathBuf {
        let parent_dir = self.full_dir(&path.parent());
        marker_path(&self.sidecar_dir_name, &parent_dir, path.name(), session)
    }

    /// Whether a download is in progress, for *this* process. A marker
    /// tagged with a different (stale, crash-orphaned) session id is
    /// treated as nonexistent (spec §4.2, §9).
    pub fn is_downloading(&self, path: &RqPath) -> bool {
        self.marker_file(path, session::current()).exists()
    }

    pub fn set_downloading(&self, path: &RqPath, downloading: bool) -> RqResult<()> {
        let marker = self.marker_file(path, session::current());
        if downloading {
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent).map_err(|e| RqError::local_io(parent, e))?;
            }
            fs::write(&marker, []).map_err(|e| RqError::local_io(&marker, e))?;
        } else {
            if marker.exists() {
                fs::remove_file(&marker).map_err(|e| RqError::local_io(&marker, e))?;
            }
            self.wake_waiters(path);
        }
        Ok(())
    }

    /// Queue `callback` to run once the in-progress download of `path`
    /// completes. Runs immediately if no download is in progress.
    pub fn wait_on_download(&self, path: &RqPath, callback: impl FnOnce() + Send + 'static) {
        if !self.is_downloading(path) {
            callback();
            return;
        }
        let key = self.full_dir(path);
        self.waiters.lock().entry(key).or_default().push(Box::new(callback));
    }

    fn wake_waiters(&self, path: &RqPath) {
        let key = self.full_dir(path);
        let callbacks = self.waiters.lock().remove(&key).unwrap_or_default();
        for callback in callbacks {
            callback();
        }
    }

    /// The effective-timestamp rule of spec §4.2: report the remote
    /// timestamp instead of the content's own when the cache entry is
    /// unmodified since it was synced and the remote has since moved
    /// to an older version.
    pub fn effective_last_modified(
        &self,
        info: &CacheInfo,
        content_last_modified: SystemTime,
    ) -> SystemTime {
        if let Some(remote) = info.remote {
            let unmodified_since_cache = content_last_modified == info.local_last_modified;
            let remote_older = remote.last_modified < content_last_modified;
            if !info.created && unmodified_since_cache && remote_older && !info.refreshed {
                return remote.last_modified;
            }
        }
        content_last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let tree = WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR);
        let path = RqPath::new("/docs/file.txt").unwrap();
        tree.create_sidecar(&path, true, None, false, SystemTime::now()).unwrap();
        let info = tree.read_sidecar(&path).unwrap();
        assert!(info.created);
        assert!(info.remote.is_none());
    }

    #[test]
    fn create_twice_without_created_locally_fails() {
        let dir = tempdir().unwrap();
        let tree = WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR);
        let path = RqPath::new("/a").unwrap();
        tree.create_sidecar(&path, true, None, false, SystemTime::now()).unwrap();
        let err = tree.create_sidecar(&path, false, None, false, SystemTime::now());
        assert!(err.is_err());
    }

    #[test]
    fn download_waiters_fire_on_clear() {
        let dir = tempdir().unwrap();
        let tree = WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR);
        let path = RqPath::new("/big").unwrap();
        tree.set_downloading(&path, true).unwrap();
        assert!(tree.is_downloading(&path));

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        tree.wait_on_download(&path, move || {
            fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));

        tree.set_downloading(&path, false).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!tree.is_downloading(&path));
    }

    #[test]
    fn effective_last_modified_prefers_remote_on_unmodified_revert() {
        let dir = tempdir().unwrap();
        let tree = WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR);
        let synced_at = from_millis(1_000);
        let info = CacheInfo {
            local_last_modified: synced_at,
            remote: Some(RemoteInfo {
                last_modified: from_millis(500),
                created: from_millis(100),
            }),
            created: false,
            refreshed: false,
            synced: synced_at,
        };
        let effective = tree.effective_last_modified(&info, synced_at);
        assert_eq!(effective, from_millis(500));
    }

    #[test]
    fn effective_last_modified_ignores_remote_when_refreshed() {
        let dir = tempdir().unwrap();
        let tree = WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR);
        let synced_at = from_millis(1_000);
        let info = CacheInfo {
            local_last_modified: synced_at,
            remote: Some(RemoteInfo {
                last_modified: from_millis(500),
                created: from_millis(100),
            }),
            created: false,
            refreshed: true,
            synced: synced_at,
        };
        let effective = tree.effective_last_modified(&info, synced_at);
        assert_eq!(effective, synced_at);
    }
}

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use ssh2::{OpenFlags, OpenType, Session, Sftp};

use crate::error::{RqError, RqResult};
use crate::path::RqPath;

/// A node as seen on the remote content repository (spec §3 File/Directory
/// Node, remote flavor).
#[derive(Clone, Debug)]
pub struct RemoteNode {
    pub path: RqPath,
    pub is_directory: bool,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_modified_at: SystemTime,
}

/// The contract every remote repository must fulfill (spec §1, §6):
/// RQTree, LocalTree and the Processor all program against this trait,
/// never against a concrete transport.
pub trait RemoteTree: Send + Sync {
    fn exists(&self, path: &RqPath) -> RqResult<bool>;
    fn stat(&self, path: &RqPath) -> RqResult<RemoteNode>;
    fn list(&self, path: &RqPath) -> RqResult<Vec<RemoteNode>>;
    fn read_to_end(&self, path: &RqPath) -> RqResult<Vec<u8>>;
    fn put(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode>;
    fn post(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode>;
    fn delete(&self, path: &RqPath) -> RqResult<()>;
    fn create_directory(&self, path: &RqPath) -> RqResult<()>;
    fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<()>;
}

/// Credentials for [`SftpRemoteTree::connect`]. Session handling and
/// credential storage proper live outside this crate (spec §1); this is
/// just enough to stand the concrete remote tree up.
pub struct SftpCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

const DEFAULT_SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`RemoteTree`] backed by an SFTP session (spec §1's "concrete
/// remote-tree implementation", provided here as the worked example the
/// Processor exercises in integration tests).
pub struct SftpRemoteTree {
    _session: Session,
    sftp: Sftp,
}

impl SftpRemoteTree {
    pub fn connect(credentials: &SftpCredentials) -> RqResult<Self> {
        let (host, port) = split_host_port(&credentials.host);
        let addr = format!("{host}:{port}");
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| RqError::transport(anyhow::anyhow!("resolving {addr}: {e}")))?
            .next()
            .ok_or_else(|| RqError::transport(anyhow::anyhow!("unable to resolve {host}")))?;

        let stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)
            .map_err(|e| RqError::transport(anyhow::anyhow!("connecting to {addr}: {e}")))?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT)).ok();
        stream.set_write_timeout(Some(CONNECT_TIMEOUT)).ok();

        let mut session =
            Session::new().map_err(|e| RqError::transport(anyhow::anyhow!("ssh session: {e}")))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| RqError::transport(anyhow::anyhow!("handshake: {e}")))?;
        session
            .userauth_password(&credentials.username, &credentials.password)
            .map_err(|e| RqError::transport(anyhow::anyhow!("authentication: {e}")))?;
        if !session.authenticated() {
            return Err(RqError::transport(anyhow::anyhow!("authentication rejected")));
        }

        let sftp = session
            .sftp()
            .map_err(|e| RqError::transport(anyhow::anyhow!("starting sftp subsystem: {e}")))?;
        Ok(Self {
            _session: session,
            sftp,
        })
    }

    fn os_path(path: &RqPath) -> std::path::PathBuf {
        std::path::PathBuf::from(path.as_str())
    }
}

fn split_host_port(host: &str) -> (String, u16) {
    if let Some((name, port_str)) = host.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (name.to_string(), port);
        }
    }
    (host.to_string(), DEFAULT_SSH_PORT)
}

fn stat_to_node(path: &RqPath, stat: &ssh2::FileStat) -> RemoteNode {
    RemoteNode {
        path: path.clone(),
        is_directory: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        created_at: stat
            .mtime
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or(SystemTime::UNIX_EPOCH),
        last_modified_at: stat
            .mtime
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

impl RemoteTree for SftpRemoteTree {
    fn exists(&self, path: &RqPath) -> RqResult<bool> {
        Ok(self.sftp.stat(&Self::os_path(path)).is_ok())
    }

    fn stat(&self, path: &RqPath) -> RqResult<RemoteNode> {
        let stat = self
            .sftp
            .stat(&Self::os_path(path))
            .map_err(|_| RqError::not_found(path.to_string()))?;
        Ok(stat_to_node(path, &stat))
    }

    fn list(&self, path: &RqPath) -> RqResult<Vec<RemoteNode>> {
        let entries = self
            .sftp
            .readdir(&Self::os_path(path))
            .map_err(|e| RqError::transport(anyhow::anyhow!("readdir {path}: {e}")))?;
        let mut out = Vec::with_capacity(entries.len());
        for (entry_path, stat) in entries {
            let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            let child = path.join(name)?;
            out.push(stat_to_node(&child, &stat));
        }
        Ok(out)
    }

    fn read_to_end(&self, path: &RqPath) -> RqResult<Vec<u8>> {
        let mut file = self
            .sftp
            .open(&Self::os_path(path))
            .map_err(|_| RqError::not_found(path.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| RqError::transport(anyhow::anyhow!("reading {path}: {e}")))?;
        Ok(buf)
    }

    fn put(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode> {
        if !path.parent().is_root() {
            self.create_directory(&path.parent())?;
        }
        let mut file = self
            .sftp
            .open_mode(
                &Self::os_path(path),
                OpenFlags::WRITE | OpenFlags::TRUNCATE | OpenFlags::CREATE,
                0o644,
                OpenType::File,
            )
            .map_err(|e| RqError::transport(anyhow::anyhow!("opening {path} for write: {e}")))?;
        file.write_all(body)
            .map_err(|e| RqError::transport(anyhow::anyhow!("writing {path}: {e}")))?;
        self.stat(path)
    }

    fn post(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode> {
        self.put(path, body)
    }

    fn delete(&self, path: &RqPath) -> RqResult<()> {
        self.sftp
            .unlink(&Self::os_path(path))
            .map_err(|e| RqError::transport(anyhow::anyhow!("deleting {path}: {e}")))
    }

    fn create_directory(&self, path: &RqPath) -> RqResult<()> {
        if self.sftp.stat(&Self::os_path(path)).is_ok() {
            return Ok(());
        }
        self.sftp
            .mkdir(&Self::os_path(path), 0o755)
            .map_err(|e| RqError::transport(anyhow::anyhow!("mkdir {path}: {e}")))
    }

    fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<()> {
        self.sftp
            .rename(&Self::os_path(old), &Self::os_path(new), None)
            .map_err(|e| RqError::transport(anyhow::anyhow!("renaming {old} to {new}: {e}")))
    }
}

/// An in-memory [`RemoteTree`], the backing store for this crate's unit
/// and scenario tests (spec §8). Grounded in the teacher's `InMemoryRemote`.
#[derive(Clone, Default)]
pub struct InMemoryRemoteTree {
    entries: Arc<Mutex<HashMap<RqPath, (Vec<u8>, bool, SystemTime)>>>,
}

impl InMemoryRemoteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed the remote with a file without going through
    /// the trait (so tests can set up state RQTree hasn't touched yet).
    pub fn seed_file(&self, path: &RqPath, body: &[u8]) {
        self.entries
            .lock()
            .insert(path.clone(), (body.to_vec(), false, SystemTime::now()));
    }

    pub fn remove_entry(&self, path: &RqPath) {
        self.entries.lock().remove(path);
    }
}

impl RemoteTree for InMemoryRemoteTree {
    fn exists(&self, path: &RqPath) -> RqResult<bool> {
        Ok(self.entries.lock().contains_key(path))
    }

    fn stat(&self, path: &RqPath) -> RqResult<RemoteNode> {
        let entries = self.entries.lock();
        let (bytes, is_dir, modified) = entries
            .get(path)
            .ok_or_else(|| RqError::not_found(path.to_string()))?;
        Ok(RemoteNode {
            path: path.clone(),
            is_directory: *is_dir,
            size: bytes.len() as u64,
            created_at: *modified,
            last_modified_at: *modified,
        })
    }

    fn list(&self, path: &RqPath) -> RqResult<Vec<RemoteNode>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(candidate, _)| candidate.parent() == *path && **candidate != *path)
            .map(|(candidate, (bytes, is_dir, modified))| RemoteNode {
                path: candidate.clone(),
                is_directory: *is_dir,
                size: bytes.len() as u64,
                created_at: *modified,
                last_modified_at: *modified,
            })
            .collect())
    }

    fn read_to_end(&self, path: &RqPath) -> RqResult<Vec<u8>> {
        self.entries
            .lock()
            .get(path)
            .map(|(bytes, _, _)| bytes.clone())
            .ok_or_else(|| RqError::not_found(path.to_string()))
    }

    fn put(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode> {
        self.entries
            .lock()
            .insert(path.clone(), (body.to_vec(), false, SystemTime::now()));
        self.stat(path)
    }

    fn post(&self, path: &RqPath, body: &[u8]) -> RqResult<RemoteNode> {
        self.put(path, body)
    }

    fn delete(&self, path: &RqPath) -> RqResult<()> {
        self.entries
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RqError::not_found(path.to_string()))
    }

    fn create_directory(&self, path: &RqPath) -> RqResult<()> {
        self.entries
            .lock()
            .entry(path.clone())
            .or_insert_with(|| (Vec::new(), true, SystemTime::now()));
        Ok(())
    }

    fn rename(&self, old: &RqPath, new: &RqPath) -> RqResult<()> {
        let mut entries = self.entries.lock();
        let value = entries
            .remove(old)
            .ok_or_else(|| RqError::not_found(old.to_string()))?;
        entries.insert(new.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_remote_round_trips_put_and_read() {
        let remote = InMemoryRemoteTree::new();
        let path = RqPath::new("/a").unwrap();
        remote.put(&path, b"hello").unwrap();
        assert_eq!(remote.read_to_end(&path).unwrap(), b"hello");
    }

    #[test]
    fn in_memory_remote_lists_direct_children_only() {
        let remote = InMemoryRemoteTree::new();
        remote.put(&RqPath::new("/dir/a").unwrap(), b"1").unwrap();
        remote.put(&RqPath::new("/dir/sub/b").unwrap(), b"2").unwrap();
        let listed = remote.list(&RqPath::new("/dir").unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path.as_str(), "/dir/a");
    }

    #[test]
    fn in_memory_remote_rename_moves_entry() {
        let remote = InMemoryRemoteTree::new();
        let old = RqPath::new("/old").unwrap();
        let new = RqPath::new("/new").unwrap();
        remote.put(&old, b"x").unwrap();
        remote.rename(&old, &new).unwrap();
        assert!(!remote.exists(&old).unwrap());
        assert_eq!(remote.read_to_end(&new).unwrap(), b"x");
    }
}

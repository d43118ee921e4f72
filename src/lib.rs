//! `rqfs` — an offline-capable caching bridge between a local file tree
//! and a remote content repository reached over an HTTP-style resource
//! API (see `SPEC_FULL.md`). Clients work against [`Share`], which owns
//! one instance of each tree in the three-tree cache coherence engine
//! plus the background [`Processor`] that drains the [`RequestQueue`].

pub mod config;
pub mod error;
pub mod events;
pub mod list_merge;
pub mod local_tree;
pub mod metadata;
pub mod path;
pub mod processor;
pub mod queue;
pub mod raw_store;
pub mod remote_tree;
pub mod rq_tree;
pub mod session;

use std::sync::Arc;

use crossbeam_channel::Receiver;

pub use config::{ProcessorConfig, ShareConfig};
pub use error::{RqError, RqResult};
pub use events::{EventBus, RqEvent};
pub use local_tree::{LocalFile, LocalTree};
pub use metadata::{CacheInfo, RemoteInfo, WorkTree};
pub use path::RqPath;
pub use processor::Processor;
pub use queue::{Action, Method, QueueRecord, RequestQueue};
pub use raw_store::LocalRawStore;
pub use remote_tree::{InMemoryRemoteTree, RemoteNode, RemoteTree, SftpCredentials, SftpRemoteTree};
pub use rq_tree::{RqEntry, RqFile, RQTree};

/// Owns every moving part of one cached share: the client-facing
/// [`RQTree`], the durable [`RequestQueue`] it drives, and the
/// background [`Processor`] that replays it against the remote (spec
/// §1, §6). Construct one per remote share a client connects to.
pub struct Share<R: RemoteTree + 'static> {
    tree: Arc<RQTree<R>>,
    processor: Option<Processor<R>>,
    events: EventBus,
    receiver: Receiver<RqEvent>,
}

impl<R: RemoteTree + 'static> Share<R> {
    /// Wire up the three trees and the request queue against
    /// `local_root`/`remote`, and start the background Processor unless
    /// `config.no_processor` is set.
    pub fn open(local_root: impl Into<std::path::PathBuf>, remote: Arc<R>, config: ShareConfig) -> RqResult<Self> {
        let local_root = local_root.into();
        let (events, receiver) = EventBus::new();
        Self::open_with_events(local_root, remote, config, events, receiver)
    }

    /// Same as [`Share::open`], but takes an already-built bus/receiver
    /// pair so no events are lost between construction and the caller's
    /// first `subscribe` call.
    pub fn open_with_events(
        local_root: impl Into<std::path::PathBuf>,
        remote: Arc<R>,
        mut config: ShareConfig,
        events: EventBus,
        receiver: Receiver<RqEvent>,
    ) -> RqResult<Self> {
        let local_root = local_root.into();
        config.local_path = local_root.clone();

        let store = LocalRawStore::new(local_root.clone());
        let work = Arc::new(WorkTree::new(local_root.clone(), config.sidecar_dir_name.clone()));
        let local = Arc::new(LocalTree::new(store, work, false));

        let queue_path = config.work_path.join("request-queue.db");
        let queue = Arc::new(RequestQueue::open(queue_path, events.clone())?);

        let tree = Arc::new(RQTree::new(
            local.clone(),
            remote.clone(),
            queue.clone(),
            events.clone(),
            config.clone(),
        ));

        let mut processor = Processor::new(queue, remote, local, events.clone(), config.processor.clone());
        if !config.no_processor {
            processor.start();
        }

        Ok(Self {
            tree,
            processor: Some(processor),
            events,
            receiver,
        })
    }

    pub fn tree(&self) -> &Arc<RQTree<R>> {
        &self.tree
    }

    /// A receiving end of the share's event bus. `Receiver` is itself
    /// cloneable; every clone competes for the same stream of events
    /// (this is not a broadcast fan-out).
    pub fn subscribe(&self) -> Receiver<RqEvent> {
        self.receiver.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop the Processor and release cached state. The on-disk cache
    /// and queue are left intact for the next `open`.
    pub fn disconnect(&mut self) {
        if let Some(mut processor) = self.processor.take() {
            processor.stop();
        }
        self.tree.disconnect();
    }
}

impl<R: RemoteTree + 'static> Drop for Share<R> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_tree_and_stops_cleanly() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(InMemoryRemoteTree::new());
        let mut config = ShareConfig::default();
        config.work_path = dir.path().join(".rqfs");
        config.no_processor = true;

        let mut share = Share::open(dir.path(), remote, config).unwrap();
        let path = RqPath::new("/doc").unwrap();
        share.tree().create_file(&path).unwrap();
        assert!(share.tree().exists(&path).unwrap());
        share.disconnect();
    }
}

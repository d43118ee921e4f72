use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::path::RqPath;
use crate::queue::Method;

/// The share-level event bus (spec §6). One bus per [`crate::Share`]
/// instance; every tree, the metadata store and the Processor publish
/// onto it, and callers subscribe with [`EventBus::subscribe`].
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<RqEvent>,
}

#[derive(Clone, Debug)]
pub enum RqEvent {
    RequestQueueInit,
    SyncFileStart { method: Method, path: RqPath },
    SyncFileEnd { method: Method, path: RqPath },
    SyncFileErr { method: Method, path: RqPath, message: String },
    SyncErr { message: String },
    SyncPurged { files: Vec<RqPath> },
    SyncFileAbort { method: Method, path: RqPath },
    SyncFileProgress { path: RqPath, sent: u64, total: Option<u64> },
    SyncConflict { path: RqPath },
    ItemUpdated { path: RqPath },
    PathUpdated { parent: RqPath },
}

impl EventBus {
    pub fn new() -> (Self, Receiver<RqEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RqEvent) {
        tracing::trace!(?event, "rqfs event");
        // A bus with no remaining subscribers is a normal terminal state
        // (the share is disconnecting); dropping the event is correct.
        let _ = self.tx.send(event);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ProcessorConfig;
use crate::events::{EventBus, RqEvent};
use crate::local_tree::LocalTree;
use crate::metadata::RemoteInfo;
use crate::path::RqPath;
use crate::queue::{Method, QueueRecord, RequestQueue};
use crate::remote_tree::RemoteTree;

/// Long-running drain of the [`RequestQueue`] against a [`RemoteTree`],
/// with retries, purge policy and progress events (spec §4.7).
///
/// Runs on a single background thread — this core has no need for a
/// worker pool; replay order only matters per-path, and the queue
/// already serializes collapsing at the (parent, name) key.
pub struct Processor<R: RemoteTree> {
    queue: Arc<RequestQueue>,
    remote: Arc<R>,
    local: Arc<LocalTree>,
    events: EventBus,
    config: ProcessorConfig,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<R: RemoteTree + 'static> Processor<R> {
    pub fn new(
        queue: Arc<RequestQueue>,
        remote: Arc<R>,
        local: Arc<LocalTree>,
        events: EventBus,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            local,
            events,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the drain loop. A no-op if already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let queue = self.queue.clone();
        let remote = self.remote.clone();
        let local = self.local.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();

        self.handle = Some(thread::spawn(move || {
            run_loop(&queue, remote.as_ref(), &local, &events, &config, &stop);
        }));
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<R: RemoteTree> Drop for Processor<R> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    queue: &RequestQueue,
    remote: &dyn RemoteTree,
    local: &LocalTree,
    events: &EventBus,
    config: &ProcessorConfig,
    stop: &AtomicBool,
) {
    let mut since_last_purge = Duration::ZERO;
    let tick = Duration::from_millis(config.frequency_millis.max(1));

    while !stop.load(Ordering::SeqCst) {
        let mut drained_any = false;
        while let Some(record) = queue.get_process_request(config.expiration_millis, config.max_retries) {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            drained_any = true;
            process_one(queue, remote, local, events, config, &record);
        }

        since_last_purge += tick;
        if since_last_purge >= Duration::from_millis(config.purge_failed_millis) {
            since_last_purge = Duration::ZERO;
            if let Err(e) = queue.purge_failed_requests(config.max_retries) {
                events.emit(RqEvent::SyncErr {
                    message: format!("purge sweep failed: {e}"),
                });
            }
        }

        if !drained_any {
            thread::sleep(tick);
        }
    }
}

fn process_one(
    queue: &RequestQueue,
    remote: &dyn RemoteTree,
    local: &LocalTree,
    events: &EventBus,
    config: &ProcessorConfig,
    record: &QueueRecord,
) {
    let full_path = record.full_path();
    events.emit(RqEvent::SyncFileStart {
        method: record.method,
        path: full_path.clone(),
    });

    let outcome = apply_record(remote, local, record, &full_path);

    match outcome {
        Ok(()) => {
            if let Err(e) = queue.complete_request(&record.path, &record.name) {
                events.emit(RqEvent::SyncErr {
                    message: format!("completing {full_path}: {e}"),
                });
            }
            events.emit(RqEvent::SyncFileEnd {
                method: record.method,
                path: full_path,
            });
        }
        Err(e) => {
            if e.is_retryable() {
                if let Err(inner) = queue.increment_retry_count(&record.path, &record.name, config.retry_delay_millis)
                {
                    events.emit(RqEvent::SyncErr {
                        message: format!("retry bookkeeping for {full_path}: {inner}"),
                    });
                }
                events.emit(RqEvent::SyncFileErr {
                    method: record.method,
                    path: full_path,
                    message: e.to_string(),
                });
            } else {
                events.emit(RqEvent::SyncFileAbort {
                    method: record.method,
                    path: full_path,
                });
                let _ = queue.remove_request(&record.path, &record.name);
            }
        }
    }
}

fn apply_record(
    remote: &dyn RemoteTree,
    local: &LocalTree,
    record: &QueueRecord,
    full_path: &RqPath,
) -> crate::error::RqResult<()> {
    match record.method {
        Method::Delete => remote.delete(full_path).or_else(|e| {
            // already gone on the remote is an acceptable terminal state.
            if matches!(e, crate::error::RqError::NotFound { .. }) {
                Ok(())
            } else {
                Err(e)
            }
        }),
        Method::Put | Method::Post => {
            let bytes = local.store().read_to_end(full_path)?;
            let node = if record.method == Method::Put {
                remote.put(full_path, &bytes)?
            } else {
                remote.post(full_path, &bytes)?
            };
            let remote_info = RemoteInfo {
                last_modified: node.last_modified_at,
                created: node.created_at,
            };
            let raw = local.store().stat(full_path)?;
            local.work().refresh_sidecar(full_path, remote_info, raw.last_modified_at)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::metadata::{WorkTree, DEFAULT_SIDECAR_DIR};
    use crate::path::RqPath;
    use crate::queue::Action;
    use crate::raw_store::LocalRawStore;
    use crate::remote_tree::InMemoryRemoteTree;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            expiration_millis: 0,
            max_retries: 3,
            retry_delay_millis: 0,
            frequency_millis: 10,
            purge_failed_millis: 50,
        }
    }

    #[test]
    fn drains_a_queued_put_to_the_remote() {
        let dir = tempdir().unwrap();
        let store = LocalRawStore::new(dir.path());
        let work = Arc::new(WorkTree::new(dir.path(), DEFAULT_SIDECAR_DIR));
        let local = Arc::new(LocalTree::new(store, work, false));
        let remote = Arc::new(InMemoryRemoteTree::new());
        let (bus, _rx) = EventBus::new();
        let queue = Arc::new(RequestQueue::open(dir.path().join("request-queue.db"), bus.clone()).unwrap());

        let path = RqPath::new("/doc").unwrap();
        local.create_file(&path).unwrap();
        local.store().write_all(&path, b"payload").unwrap();
        queue
            .queue_request(Action::Put, &RqPath::root(), "doc", dir.path(), RqPath::root())
            .unwrap();

        let mut processor = Processor::new(queue.clone(), remote.clone(), local.clone(), bus, fast_config());
        processor.start();

        let mut waited = Duration::ZERO;
        while queue.get_requests(&RqPath::root()).contains_key("doc") && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(20));
            waited += Duration::from_millis(20);
        }
        processor.stop();

        assert!(remote.exists(&path).unwrap());
        assert_eq!(remote.read_to_end(&path).unwrap(), b"payload");
    }
}

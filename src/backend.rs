use crate::invalidator::{Invalidator, SweepReport};
use crate::sync::{LeaseSync, SyncOutcome};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Commands sent from the dispatch thread to the background worker.
pub enum WorkerCommand {
    SyncNow {
        reply: mpsc::Sender<Result<SyncOutcome, String>>,
    },
    Sweep {
        reply: mpsc::Sender<Result<SweepReport, String>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub sync_interval: Duration,
    pub sweep_interval: Duration,
}

pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn request<T>(
        &self,
        make: impl FnOnce(mpsc::Sender<Result<T, String>>) -> WorkerCommand,
    ) -> Result<T, String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| "background worker has stopped".to_string())?;
        reply_rx
            .recv()
            .map_err(|_| "background worker dropped the request".to_string())?
    }

    /// Run a sync cycle (with retries) now and wait for it.
    pub fn sync_now(&self) -> Result<SyncOutcome, String> {
        self.request(|reply| WorkerCommand::SyncNow { reply })
    }

    pub fn sweep_now(&self) -> Result<SweepReport, String> {
        self.request(|reply| WorkerCommand::Sweep { reply })
    }

    /// Stop the worker and wait for any cycle in progress to finish.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("[Worker] background thread panicked");
            }
        }
    }
}

/// Spawn the background worker: periodic sweep and sync plus on-demand
/// requests.
pub fn spawn(
    sync: Arc<LeaseSync>,
    invalidator: Arc<Invalidator>,
    schedule: Schedule,
) -> std::io::Result<WorkerHandle> {
    let (tx, rx) = mpsc::channel::<WorkerCommand>();
    let thread = thread::Builder::new()
        .name("mailcache-worker".into())
        .spawn(move || worker_loop(sync, invalidator, schedule, rx))?;
    Ok(WorkerHandle {
        tx,
        thread: Some(thread),
    })
}

fn run_sweep(invalidator: &Invalidator) -> Result<SweepReport, String> {
    invalidator.sweep().map_err(|e| {
        warn!("[Worker] sweep failed: {}", e);
        e.to_string()
    })
}

fn run_sync(sync: &LeaseSync) -> Result<SyncOutcome, String> {
    sync.sync_with_retry().map_err(|e| e.to_string())
}

fn worker_loop(
    sync: Arc<LeaseSync>,
    invalidator: Arc<Invalidator>,
    schedule: Schedule,
    rx: mpsc::Receiver<WorkerCommand>,
) {
    let mut next_sync = Instant::now() + schedule.sync_interval;
    let mut next_sweep = Instant::now() + schedule.sweep_interval;
    info!(
        "[Worker] started (sync every {:?}, sweep every {:?})",
        schedule.sync_interval, schedule.sweep_interval
    );

    loop {
        let wait = next_sync
            .min(next_sweep)
            .saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(WorkerCommand::SyncNow { reply }) => {
                let _ = reply.send(run_sync(&sync));
                next_sync = Instant::now() + schedule.sync_interval;
            }
            Ok(WorkerCommand::Sweep { reply }) => {
                let _ = reply.send(run_sweep(&invalidator));
                next_sweep = Instant::now() + schedule.sweep_interval;
            }
            Ok(WorkerCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                if now >= next_sweep {
                    debug!("[Worker] periodic sweep");
                    let _ = run_sweep(&invalidator);
                    next_sweep = Instant::now() + schedule.sweep_interval;
                }
                if now >= next_sync {
                    debug!("[Worker] periodic sync");
                    let _ = run_sync(&sync);
                    next_sync = Instant::now() + schedule.sync_interval;
                }
            }
        }
    }
    info!("[Worker] stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;
    use crate::config::{AnalysisConfig, RemoteBackend, RemoteConfig, SyncConfig};
    use crate::error::StoreError;
    use crate::invalidator::ExpiryPolicy;
    use crate::testutil::message;
    use crate::threads::ThreadGraphBuilder;

    fn setup(
        blobs: &Arc<MemoryBlobStore>,
    ) -> (tempfile::TempDir, Arc<ManualClock>, Arc<CacheStore>, Arc<LeaseSync>, Arc<Invalidator>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::fixed());
        let store = Arc::new(
            CacheStore::open(&dir.path().join("s.redb"), ExpiryPolicy::default(), clock.clone())
                .unwrap(),
        );
        let threads = Arc::new(ThreadGraphBuilder::new(&AnalysisConfig::default()));
        let invalidator = Arc::new(Invalidator::new(store.clone(), threads));
        let remote = RemoteConfig {
            backend: RemoteBackend::Dir {
                path: "/unused".into(),
            },
            store_object: "store.json".into(),
            lease_object: "lease".into(),
            holder: Some("worker-test:1".into()),
        };
        let sync = Arc::new(LeaseSync::new(
            store.clone(),
            blobs.clone(),
            invalidator.clone(),
            clock.clone(),
            &remote,
            &SyncConfig::default(),
        ));
        (dir, clock, store, sync, invalidator)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_on_demand_sync_and_sweep() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let (_dir, clock, store, sync, invalidator) = setup(&blobs);
        let now = clock.now();
        store
            .write(|txn| {
                txn.upsert_message(message("m1", "INBOX", "s", "a@x.com", now))?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let worker = spawn(
            sync,
            invalidator,
            Schedule {
                sync_interval: HOUR,
                sweep_interval: HOUR,
            },
        )
        .unwrap();
        let outcome = worker.sync_now().unwrap();
        assert!(outcome.uploaded_bytes > 0);
        assert!(blobs.raw("store.json").is_some());

        clock.advance(chrono::Duration::hours(25));
        let report = worker.sweep_now().unwrap();
        assert_eq!(report.messages, 1);
        worker.shutdown();
    }

    #[test]
    fn test_periodic_sync_fires() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let (_dir, _clock, _store, sync, invalidator) = setup(&blobs);
        let worker = spawn(
            sync,
            invalidator,
            Schedule {
                sync_interval: Duration::from_millis(10),
                sweep_interval: HOUR,
            },
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while blobs.raw("store.json").is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();
        assert!(blobs.raw("store.json").is_some());
    }
}

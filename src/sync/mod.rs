//! Keeps the local store and the remote snapshot object in step. Every
//! remote read-modify-write happens while holding the lease.

mod lease;

pub use lease::{default_holder, Lease, LeaseGuard, LeaseManager};

use crate::blob::{BlobStore, Precondition};
use crate::cache::{CacheStore, MergeReport, META_REMOTE_ETAG};
use crate::clock::Clock;
use crate::config::{RemoteConfig, SyncConfig};
use crate::error::{BlobError, StoreError, SyncError};
use crate::invalidator::Invalidator;
use crate::models::{StoreSnapshot, SNAPSHOT_VERSION};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exponential delay sequence, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            next: base.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub remote: String,
    pub holder: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Serving from the local copy only until a cycle succeeds again.
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub merged: Option<MergeReport>,
    pub swept: usize,
    pub uploaded_bytes: usize,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Local copy replaced with the remote snapshot.
    Downloaded { messages: usize },
    /// Remote unchanged since our last sync; local copy kept.
    Current,
    /// No remote snapshot; local rows uploaded.
    UploadedLocal { messages: usize },
    /// Neither side has anything.
    Empty,
    /// Remote unreadable; healthy local copy uploaded over it.
    ReplacedCorruptRemote { messages: usize },
    /// Remote unreadable and no local rows: starting empty with no folder
    /// cursors, so every folder's next batch is a full fetch.
    DataLoss,
}

fn encode(snapshot: &StoreSnapshot) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(snapshot).map_err(|e| SyncError::Store(StoreError::Codec(e)))
}

fn decode(data: &[u8]) -> Result<StoreSnapshot, SyncError> {
    let snapshot: StoreSnapshot =
        serde_json::from_slice(data).map_err(|e| SyncError::Corrupt(e.to_string()))?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(SyncError::Corrupt(format!(
            "snapshot version {} is newer than supported {}",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    Ok(snapshot)
}

pub struct LeaseSync {
    store: Arc<CacheStore>,
    blobs: Arc<dyn BlobStore>,
    lease: LeaseManager,
    invalidator: Arc<Invalidator>,
    clock: Arc<dyn Clock>,
    store_key: String,
    config: SyncConfig,
    status: Mutex<SyncStatus>,
}

impl LeaseSync {
    pub fn new(
        store: Arc<CacheStore>,
        blobs: Arc<dyn BlobStore>,
        invalidator: Arc<Invalidator>,
        clock: Arc<dyn Clock>,
        remote: &RemoteConfig,
        config: &SyncConfig,
    ) -> Self {
        let holder = remote.holder.clone().unwrap_or_else(default_holder);
        let lease = LeaseManager::new(
            blobs.clone(),
            &remote.lease_object,
            &holder,
            config.lease_window,
            clock.clone(),
        );
        let status = SyncStatus {
            remote: blobs.describe(),
            holder,
            ..Default::default()
        };
        LeaseSync {
            store,
            blobs,
            lease,
            invalidator,
            clock,
            store_key: remote.store_object.clone(),
            config: config.clone(),
            status: Mutex::new(status),
        }
    }

    pub fn status(&self) -> SyncStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, f: F) {
        let mut guard = match self.status.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    fn record_success(&self) {
        let now = self.clock.now();
        self.update_status(|s| {
            if s.degraded {
                info!("[Sync] remote reachable again, leaving degraded mode");
            }
            s.last_success = Some(now);
            s.last_attempt = Some(now);
            s.last_error = None;
            s.consecutive_failures = 0;
            s.degraded = false;
        });
    }

    fn record_failure(&self, err: &SyncError) {
        let now = self.clock.now();
        let degraded_after = self.config.degraded_after;
        self.update_status(|s| {
            s.last_attempt = Some(now);
            s.last_error = Some(err.to_string());
            if err.is_contention() {
                return;
            }
            s.consecutive_failures += 1;
            if !s.degraded && s.consecutive_failures >= degraded_after {
                error!(
                    "[Sync] {} consecutive failed cycles, serving from local cache only",
                    s.consecutive_failures
                );
                s.degraded = true;
            }
        });
    }

    /// Run `f` under the lease. The lease is released on every path.
    fn with_lease<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut LeaseGuard) -> Result<T, SyncError>,
    {
        let mut guard = self.lease.acquire()?;
        let result = f(&mut guard);
        if let Err(e) = self.lease.release(guard) {
            warn!("[Sync] lease release failed: {}", e);
        }
        result
    }

    fn upload(&self, guard: &mut LeaseGuard, cond: Precondition) -> Result<(String, usize), SyncError> {
        let data = encode(&self.store.export_snapshot()?)?;
        if self
            .lease
            .needs_refresh(guard, self.config.lease_refresh_fraction)
        {
            self.lease.refresh(guard)?;
        }
        let etag = match self.blobs.put(&self.store_key, &data, &cond) {
            Ok(etag) => etag,
            Err(BlobError::PreconditionFailed(_)) => {
                return Err(SyncError::LeaseLost(
                    "remote snapshot was written by a holder without the lease".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        self.store.set_meta(META_REMOTE_ETAG, &etag)?;
        Ok((etag, data.len()))
    }

    /// Startup reconciliation, before anything is served. Retried like a
    /// sync cycle; on final failure the local copy is served as-is.
    pub fn restore(&self) -> Result<RestoreOutcome, SyncError> {
        let outcome = self.retrying("restore", || self.restore_once());
        if let Ok(o) = &outcome {
            info!("[Sync] restore: {:?}", o);
        }
        outcome
    }

    fn restore_once(&self) -> Result<RestoreOutcome, SyncError> {
        self.with_lease(|guard| {
            let local_messages = self.store.message_count()? as usize;
            let local_empty = self.store.export_snapshot()?.is_empty();
            let blob = match self.blobs.get(&self.store_key)? {
                Some(blob) => blob,
                None if local_empty => return Ok(RestoreOutcome::Empty),
                None => {
                    self.upload(guard, Precondition::DoesNotExist)?;
                    return Ok(RestoreOutcome::UploadedLocal {
                        messages: local_messages,
                    });
                }
            };

            let known = self.store.get_meta(META_REMOTE_ETAG)?;
            if known.as_deref() == Some(blob.etag.as_str()) && !self.store.recovered() {
                return Ok(RestoreOutcome::Current);
            }

            match decode(&blob.data) {
                Ok(snapshot) => {
                    self.store.replace_with(&snapshot)?;
                    self.store.set_meta(META_REMOTE_ETAG, &blob.etag)?;
                    Ok(RestoreOutcome::Downloaded {
                        messages: snapshot.messages.len(),
                    })
                }
                Err(e) if !local_empty => {
                    warn!(
                        "[Sync] remote snapshot at {} unreadable ({}), keeping local copy",
                        self.blobs.describe(),
                        e
                    );
                    self.upload(guard, Precondition::Matches(blob.etag))?;
                    Ok(RestoreOutcome::ReplacedCorruptRemote {
                        messages: local_messages,
                    })
                }
                Err(e) => {
                    error!(
                        "[Sync] remote snapshot unreadable ({}) and no local copy; \
                         starting empty; every folder needs a full re-ingest",
                        e
                    );
                    Ok(RestoreOutcome::DataLoss)
                }
            }
        })
    }

    /// One full cycle: merge remote changes, sweep, upload.
    pub fn sync_cycle(&self) -> Result<SyncOutcome, SyncError> {
        self.with_lease(|guard| {
            let remote = self.blobs.get(&self.store_key)?;
            let known = self.store.get_meta(META_REMOTE_ETAG)?;

            let mut merged = None;
            if let Some(blob) = &remote {
                if known.as_deref() != Some(blob.etag.as_str()) {
                    match decode(&blob.data) {
                        Ok(snapshot) => {
                            let report = self.store.merge_snapshot(&snapshot)?;
                            debug!("[Sync] merged remote rows: {:?}", report);
                            merged = Some(report);
                        }
                        Err(e) => warn!(
                            "[Sync] remote snapshot unreadable ({}), overwriting with local copy",
                            e
                        ),
                    }
                }
            }

            let swept = self.invalidator.sweep()?.total();
            let cond = match &remote {
                Some(blob) => Precondition::Matches(blob.etag.clone()),
                None => Precondition::DoesNotExist,
            };
            let (etag, uploaded_bytes) = self.upload(guard, cond)?;
            info!(
                "[Sync] uploaded {} bytes to {} (etag {})",
                uploaded_bytes,
                self.blobs.describe(),
                etag
            );
            Ok(SyncOutcome {
                merged,
                swept,
                uploaded_bytes,
                etag,
            })
        })
    }

    /// `sync_cycle` with capped exponential backoff.
    pub fn sync_with_retry(&self) -> Result<SyncOutcome, SyncError> {
        self.retrying("cycle", || self.sync_cycle())
    }

    /// Run `op` up to `max_attempts` times with capped exponential backoff,
    /// recording the final result. Contention is retried like any failure
    /// but does not count towards degraded mode.
    fn retrying<T, F>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Result<T, SyncError>,
    {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) if attempt >= attempts => {
                    if e.is_contention() {
                        info!("[Sync] {} skipped: {}", what, e);
                    } else {
                        warn!("[Sync] {} failed after {} attempts: {}", what, attempt, e);
                    }
                    self.record_failure(&e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if e.is_contention() {
                        debug!("[Sync] {}: {}; retrying in {:?}", what, e, delay);
                    } else {
                        warn!(
                            "[Sync] {} attempt {}/{} failed: {}; retrying in {:?}",
                            what, attempt, attempts, e, delay
                        );
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Best-effort upload at shutdown, abandoned after `grace`.
    pub fn final_upload(self: &Arc<Self>, grace: Duration) -> Result<SyncOutcome, SyncError> {
        let (tx, rx) = mpsc::channel();
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("mailcache-final-sync".into())
            .spawn(move || {
                let _ = tx.send(this.sync_cycle());
            })
            .map_err(|e| SyncError::Transfer(BlobError::Io(e)))?;

        let result = match rx.recv_timeout(grace) {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(grace)),
        };
        match &result {
            Ok(outcome) => {
                info!("[Sync] final upload done ({} bytes)", outcome.uploaded_bytes);
                self.record_success();
            }
            Err(e) => {
                error!(
                    "[Sync] final upload failed: {}; changes since the last sync are local only",
                    e
                );
                self.record_failure(e);
            }
        }
        result
    }

    pub fn force_unlock(&self) -> Result<Option<Lease>, SyncError> {
        self.lease.force_release()
    }
}

use crate::blob::{BlobStore, Precondition};
use crate::clock::Clock;
use crate::error::{BlobError, LeaseContentionError, SyncError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Concurrent writers can make a conditional write lose; re-read this many
/// times before giving up on a cycle.
const ACQUIRE_ROUNDS: usize = 3;

/// Contents of the remote lease marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A lease we hold, with the marker's ETag for conditional refresh and
/// release.
#[derive(Debug, Clone)]
pub struct LeaseGuard {
    pub lease: Lease,
    pub etag: String,
    renewed_at: DateTime<Utc>,
}

/// `hostname:pid`.
pub fn default_holder() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    let host = if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "localhost".to_string()
    };
    format!("{}:{}", host, std::process::id())
}

pub struct LeaseManager {
    blobs: Arc<dyn BlobStore>,
    key: String,
    holder: String,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        key: &str,
        holder: &str,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        LeaseManager {
            blobs,
            key: key.to_string(),
            holder: holder.to_string(),
            window,
            clock,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn encode(lease: &Lease) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(lease).map_err(|e| SyncError::Corrupt(format!("lease encode: {}", e)))
    }

    fn fresh(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: now + self.window,
        }
    }

    /// Take the lease. Succeeds if there is no marker, the marker is ours, or
    /// it has expired or cannot be parsed. A live marker held by someone else
    /// is a `LeaseContentionError`.
    pub fn acquire(&self) -> Result<LeaseGuard, SyncError> {
        for _ in 0..ACQUIRE_ROUNDS {
            let now = self.clock.now();
            let lease = self.fresh(now);
            let data = Self::encode(&lease)?;

            let cond = match self.blobs.get(&self.key)? {
                None => Precondition::DoesNotExist,
                Some(blob) => {
                    match serde_json::from_slice::<Lease>(&blob.data) {
                        Ok(existing) if existing.holder == self.holder => {
                            debug!("[Lease] renewing our own marker");
                        }
                        Ok(existing) if existing.is_live(now) => {
                            debug!(
                                "[Lease] held by {} until {}",
                                existing.holder, existing.expires_at
                            );
                            return Err(LeaseContentionError {
                                holder: existing.holder,
                                expires_at: existing.expires_at,
                            }
                            .into());
                        }
                        Ok(existing) => {
                            info!(
                                "[Lease] taking over expired lease of {} (expired {})",
                                existing.holder, existing.expires_at
                            );
                        }
                        Err(e) => {
                            warn!("[Lease] marker unreadable ({}), taking over", e);
                        }
                    }
                    Precondition::Matches(blob.etag)
                }
            };

            match self.blobs.put(&self.key, &data, &cond) {
                Ok(etag) => {
                    debug!("[Lease] acquired by {} until {}", self.holder, lease.expires_at);
                    return Ok(LeaseGuard {
                        lease,
                        etag,
                        renewed_at: now,
                    });
                }
                // Lost a race for the marker; re-read to see who won.
                Err(BlobError::PreconditionFailed(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::LeaseLost(format!(
            "lease marker '{}' changed {} times while acquiring",
            self.key, ACQUIRE_ROUNDS
        )))
    }

    /// True once more than `fraction` of the window has passed since the
    /// lease was acquired or last refreshed.
    pub fn needs_refresh(&self, guard: &LeaseGuard, fraction: f64) -> bool {
        let elapsed = self.clock.now() - guard.renewed_at;
        let threshold_ms = (self.window.num_milliseconds() as f64 * fraction) as i64;
        elapsed.num_milliseconds() > threshold_ms
    }

    /// Push the expiry out by one window. Refused once the lease has lapsed:
    /// someone else may already hold it.
    pub fn refresh(&self, guard: &mut LeaseGuard) -> Result<(), SyncError> {
        let now = self.clock.now();
        if !guard.lease.is_live(now) {
            return Err(SyncError::LeaseLost(format!(
                "lease expired at {}",
                guard.lease.expires_at
            )));
        }
        let lease = Lease {
            expires_at: now + self.window,
            ..guard.lease.clone()
        };
        let data = Self::encode(&lease)?;
        match self
            .blobs
            .put(&self.key, &data, &Precondition::Matches(guard.etag.clone()))
        {
            Ok(etag) => {
                debug!("[Lease] refreshed until {}", lease.expires_at);
                guard.lease = lease;
                guard.etag = etag;
                guard.renewed_at = now;
                Ok(())
            }
            Err(BlobError::PreconditionFailed(_)) => Err(SyncError::LeaseLost(
                "lease marker replaced by another holder".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete our marker. Returns false if it had already been replaced.
    pub fn release(&self, guard: LeaseGuard) -> Result<bool, SyncError> {
        match self
            .blobs
            .delete(&self.key, &Precondition::Matches(guard.etag))
        {
            Ok(deleted) => {
                debug!("[Lease] released by {}", self.holder);
                Ok(deleted)
            }
            Err(BlobError::PreconditionFailed(_)) => {
                warn!("[Lease] marker changed under us; nothing to release");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove whatever marker exists. Returns the lease that was removed, if
    /// it could be read.
    pub fn force_release(&self) -> Result<Option<Lease>, SyncError> {
        let existing = self
            .blobs
            .get(&self.key)?
            .and_then(|blob| serde_json::from_slice::<Lease>(&blob.data).ok());
        self.blobs.delete(&self.key, &Precondition::None)?;
        match &existing {
            Some(lease) => warn!("[Lease] force-released lease of {}", lease.holder),
            None => info!("[Lease] no readable lease to release"),
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::clock::ManualClock;

    const KEY: &str = "mailcache.lease";

    fn manager(blobs: &Arc<MemoryBlobStore>, clock: &Arc<ManualClock>, holder: &str) -> LeaseManager {
        LeaseManager::new(
            blobs.clone(),
            KEY,
            holder,
            Duration::minutes(5),
            clock.clone(),
        )
    }

    #[test]
    fn test_contention_then_takeover_after_expiry() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let a = manager(&blobs, &clock, "host-a:1");
        let b = manager(&blobs, &clock, "host-b:2");

        let held = a.acquire().unwrap();
        clock.advance(Duration::minutes(1));
        match b.acquire() {
            Err(SyncError::Contention(c)) => {
                assert_eq!(c.holder, "host-a:1");
                assert_eq!(c.expires_at, held.lease.expires_at);
            }
            other => panic!("expected contention, got {:?}", other.map(|g| g.lease)),
        }

        clock.advance(Duration::minutes(5));
        let taken = b.acquire().unwrap();
        assert_eq!(taken.lease.holder, "host-b:2");

        // A's stale guard can neither refresh nor delete B's marker.
        let mut stale = held;
        assert!(matches!(a.refresh(&mut stale), Err(SyncError::LeaseLost(_))));
        assert!(!a.release(stale).unwrap());
        assert!(blobs.raw(KEY).is_some());
    }

    #[test]
    fn test_racing_holders_never_both_succeed() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = manager(&blobs, &clock, &format!("host-{}:{}", i, i));
                std::thread::spawn(move || m.acquire().is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_refresh_extends_and_release_deletes() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let a = manager(&blobs, &clock, "host-a:1");
        let mut guard = a.acquire().unwrap();
        assert!(!a.needs_refresh(&guard, 0.5));

        clock.advance(Duration::minutes(3));
        assert!(a.needs_refresh(&guard, 0.5));
        a.refresh(&mut guard).unwrap();
        assert_eq!(guard.lease.expires_at, clock.now() + Duration::minutes(5));
        assert!(!a.needs_refresh(&guard, 0.5));

        assert!(a.release(guard).unwrap());
        assert!(blobs.raw(KEY).is_none());
    }

    #[test]
    fn test_refresh_refused_after_lapse() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let a = manager(&blobs, &clock, "host-a:1");
        let mut guard = a.acquire().unwrap();
        clock.advance(Duration::minutes(6));
        assert!(matches!(a.refresh(&mut guard), Err(SyncError::LeaseLost(_))));
    }

    #[test]
    fn test_unreadable_marker_is_taken_over() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        blobs.seed(KEY, b"not json");
        let a = manager(&blobs, &clock, "host-a:1");
        assert!(a.acquire().is_ok());
    }

    #[test]
    fn test_force_release_removes_foreign_lease() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let a = manager(&blobs, &clock, "host-a:1");
        let b = manager(&blobs, &clock, "host-b:2");
        a.acquire().unwrap();
        let removed = b.force_release().unwrap().unwrap();
        assert_eq!(removed.holder, "host-a:1");
        assert!(b.acquire().is_ok());
    }

    #[test]
    fn test_default_holder_has_pid() {
        let holder = default_holder();
        assert!(holder.ends_with(&format!(":{}", std::process::id())));
    }
}

//! Remote object stores holding the snapshot and the lease marker. Every
//! write can be made conditional on the object's current ETag, which is all
//! the lease protocol needs.

mod dir;
mod http;

pub use dir::DirBlobStore;
pub use http::{run_password_command, HttpBlobStore};

use crate::config::{RemoteBackend, RemoteConfig};
use crate::error::BlobError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub data: Vec<u8>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    None,
    /// Create only; fails if the object exists.
    DoesNotExist,
    /// Fails unless the object exists with this ETag.
    Matches(String),
}

pub trait BlobStore: Send + Sync {
    /// Human-readable location for logs and status output.
    fn describe(&self) -> String;

    fn get(&self, key: &str) -> Result<Option<Blob>, BlobError>;

    /// Write `data` and return the new ETag.
    fn put(&self, key: &str, data: &[u8], cond: &Precondition) -> Result<String, BlobError>;

    /// Returns false if there was nothing to delete.
    fn delete(&self, key: &str, cond: &Precondition) -> Result<bool, BlobError>;
}

/// Build the configured backend.
pub fn open(config: &RemoteConfig, timeout: Duration) -> Result<Box<dyn BlobStore>, BlobError> {
    match &config.backend {
        RemoteBackend::Http {
            url,
            username,
            password_command,
        } => {
            let credentials = match (username, password_command) {
                (Some(user), Some(cmd)) => Some((user.clone(), run_password_command(cmd)?)),
                (Some(user), None) => Some((user.clone(), String::new())),
                _ => None,
            };
            Ok(Box::new(HttpBlobStore::new(url, credentials, timeout)))
        }
        RemoteBackend::Dir { path } => Ok(Box::new(DirBlobStore::open(path)?)),
    }
}

pub(crate) fn check_key(key: &str) -> Result<(), BlobError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains('/')
        || key.contains('\\')
        || key.chars().any(char::is_control);
    if bad {
        Err(BlobError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryBlobStore;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-process store with the same conditional semantics as the real
    /// backends, plus switches for injecting transport failures.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        objects: Mutex<HashMap<String, Blob>>,
        version: AtomicUsize,
        failing_puts: Mutex<HashMap<String, usize>>,
        failing_gets: AtomicUsize,
        pub puts: AtomicUsize,
    }

    impl MemoryBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` puts to `key` with a transport error.
        pub fn fail_puts(&self, key: &str, n: usize) {
            self.failing_puts.lock().unwrap().insert(key.to_string(), n);
        }

        /// Fail the next `n` gets of any key.
        pub fn fail_gets(&self, n: usize) {
            self.failing_gets.store(n, Ordering::SeqCst);
        }

        /// Unconditional write that bypasses failure injection.
        pub fn seed(&self, key: &str, data: &[u8]) -> String {
            let etag = format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1);
            self.objects.lock().unwrap().insert(
                key.to_string(),
                Blob {
                    data: data.to_vec(),
                    etag: etag.clone(),
                },
            );
            etag
        }

        pub fn raw(&self, key: &str) -> Option<Blob> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    fn check(objects: &HashMap<String, Blob>, key: &str, cond: &Precondition) -> Result<(), BlobError> {
        let ok = match (cond, objects.get(key)) {
            (Precondition::None, _) => true,
            (Precondition::DoesNotExist, existing) => existing.is_none(),
            (Precondition::Matches(etag), Some(blob)) => &blob.etag == etag,
            (Precondition::Matches(_), None) => false,
        };
        if ok {
            Ok(())
        } else {
            Err(BlobError::PreconditionFailed(key.to_string()))
        }
    }

    impl BlobStore for MemoryBlobStore {
        fn describe(&self) -> String {
            "memory".into()
        }

        fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
            if Self::take_failure(&self.failing_gets) {
                return Err(BlobError::Transport("injected get failure".into()));
            }
            Ok(self.raw(key))
        }

        fn put(&self, key: &str, data: &[u8], cond: &Precondition) -> Result<String, BlobError> {
            if let Some(n) = self.failing_puts.lock().unwrap().get_mut(key) {
                if *n > 0 {
                    *n -= 1;
                    return Err(BlobError::Transport("injected put failure".into()));
                }
            }
            let mut objects = self.objects.lock().unwrap();
            check(&objects, key, cond)?;
            let etag = format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1);
            objects.insert(
                key.to_string(),
                Blob {
                    data: data.to_vec(),
                    etag: etag.clone(),
                },
            );
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(etag)
        }

        fn delete(&self, key: &str, cond: &Precondition) -> Result<bool, BlobError> {
            let mut objects = self.objects.lock().unwrap();
            if !objects.contains_key(key) && *cond == Precondition::None {
                return Ok(false);
            }
            check(&objects, key, cond)?;
            Ok(objects.remove(key).is_some())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(check_key("store.json").is_ok());
        assert!(check_key("lease").is_ok());
        for bad in ["", "../x", "a/b", ".lock", "a\nb"] {
            assert!(check_key(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_memory_store_conditions() {
        let store = MemoryBlobStore::new();
        let e1 = store.put("k", b"one", &Precondition::DoesNotExist).unwrap();
        assert!(matches!(
            store.put("k", b"two", &Precondition::DoesNotExist),
            Err(BlobError::PreconditionFailed(_))
        ));
        let e2 = store
            .put("k", b"two", &Precondition::Matches(e1.clone()))
            .unwrap();
        assert!(store.put("k", b"x", &Precondition::Matches(e1)).is_err());
        assert!(store.delete("k", &Precondition::Matches("nope".into())).is_err());
        assert!(store.delete("k", &Precondition::Matches(e2)).unwrap());
        assert!(!store.delete("k", &Precondition::None).unwrap());
    }
}

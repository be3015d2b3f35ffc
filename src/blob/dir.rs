use super::{check_key, Blob, BlobStore, Precondition};
use crate::error::BlobError;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = ".lock";

/// Object store on a shared directory (NFS, a synced folder, a mounted
/// volume). Conditional writes are serialized with `flock` on a lock file in
/// the same directory; ETags are content hashes.
pub struct DirBlobStore {
    root: PathBuf,
}

/// Exclusive advisory lock held until drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(root: &Path) -> Result<DirLock, BlobError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(DirLock { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("\"{}\"", &hex[..32])
}

impl DirBlobStore {
    pub fn open(root: &Path) -> Result<DirBlobStore, BlobError> {
        fs::create_dir_all(root)?;
        Ok(DirBlobStore {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf, BlobError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }

    fn read(path: &Path) -> Result<Option<Blob>, BlobError> {
        match fs::read(path) {
            Ok(data) => Ok(Some(Blob {
                etag: etag_of(&data),
                data,
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn check(path: &Path, key: &str, cond: &Precondition) -> Result<(), BlobError> {
        let ok = match cond {
            Precondition::None => true,
            Precondition::DoesNotExist => !path.exists(),
            Precondition::Matches(etag) => {
                Self::read(path)?.map_or(false, |blob| &blob.etag == etag)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(BlobError::PreconditionFailed(key.to_string()))
        }
    }
}

impl BlobStore for DirBlobStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let path = self.path(key)?;
        let _lock = DirLock::acquire(&self.root)?;
        Self::read(&path)
    }

    fn put(&self, key: &str, data: &[u8], cond: &Precondition) -> Result<String, BlobError> {
        let path = self.path(key)?;
        let _lock = DirLock::acquire(&self.root)?;
        Self::check(&path, key, cond)?;

        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key, std::process::id()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        let etag = etag_of(data);
        debug!("[Blob] wrote {} ({} bytes)", path.display(), data.len());
        Ok(etag)
    }

    fn delete(&self, key: &str, cond: &Precondition) -> Result<bool, BlobError> {
        let path = self.path(key)?;
        let _lock = DirLock::acquire(&self.root)?;
        if *cond != Precondition::None {
            Self::check(&path, key, cond)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_conditional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::open(dir.path()).unwrap();
        assert!(store.get("store.json").unwrap().is_none());

        let e1 = store
            .put("store.json", b"{}", &Precondition::DoesNotExist)
            .unwrap();
        assert!(matches!(
            store.put("store.json", b"[]", &Precondition::DoesNotExist),
            Err(BlobError::PreconditionFailed(_))
        ));
        let blob = store.get("store.json").unwrap().unwrap();
        assert_eq!(blob.etag, e1);
        assert_eq!(blob.data, b"{}");

        let e2 = store
            .put("store.json", b"[1]", &Precondition::Matches(e1.clone()))
            .unwrap();
        assert_ne!(e1, e2);
        assert!(store
            .delete("store.json", &Precondition::Matches(e1))
            .is_err());
        assert!(store
            .delete("store.json", &Precondition::Matches(e2))
            .unwrap());
        assert!(!store.delete("store.json", &Precondition::None).unwrap());
    }

    #[test]
    fn test_concurrent_creates_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirBlobStore::open(dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .put("lease", format!("holder-{}", i).as_bytes(), &Precondition::DoesNotExist)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

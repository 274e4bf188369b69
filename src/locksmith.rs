//! Named mutual-exclusion locks shared by every process using a store.
//!
//! All operations that create or destroy volumes, or that change dependency
//! records, run under a lock from a [`Locksmith`]. [`GLOBAL_LOCK_KEY`]
//! serialises whole-store mutations (image creation and garbage collection)
//! against each other; narrower keys (one per image id or ChainID) serialise
//! work on a single entity.
//!
//! [`FileLocksmith`] backs each key with `locks/<key>.lock` and an exclusive
//! `flock()`. The kernel drops the lock when the holder's file descriptor
//! closes, so a process that dies while holding a lock does not wedge the
//! store. A process that hangs while holding one does: every later mutation
//! blocks until an operator kills it.
//!
//! [`MemoryLocksmith`] provides the same semantics inside one process.

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex},
};

use log::{debug, error};
use rustix::{
    fs::{flock, FlockOperation},
    io::Errno,
};

use crate::{
    digest::ChainId,
    error::{NotFoundFilter, Result, StoreError},
};

/// The key that serialises whole-store mutations.
pub const GLOBAL_LOCK_KEY: &str = "global";

/// Proof that a lock is held. Hand it back to [`Locksmith::unlock`].
#[derive(Debug)]
pub struct LockToken {
    key: String,
    file: Option<File>,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquires and releases named, blocking, exclusive locks.
///
/// Locks are not re-entrant: locking a key the caller already holds blocks
/// forever.
pub trait Locksmith: Send + Sync {
    fn lock(&self, key: &str) -> Result<LockToken>;
    fn unlock(&self, token: LockToken) -> Result<()>;

    /// Drop whatever backs `key` once the thing it guards is gone.
    ///
    /// Only call this while nobody can be holding or waiting for `key`; a
    /// waiter on a forgotten file lock would not exclude later lockers.
    fn forget(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

fn lock_error(key: &str, source: io::Error) -> StoreError {
    StoreError::Lock {
        key: key.to_string(),
        source,
    }
}

/// The lock serialising work on one bundle.
pub fn image_lock_key(id: &str) -> String {
    format!("image-{id}")
}

/// The lock serialising creation of one layer volume.
pub fn chain_lock_key(chain_id: &ChainId) -> String {
    format!("chain-{}", chain_id.hex())
}

/// Check that `key` can be used as a lock file name.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(StoreError::invalid_input(format!("invalid lock key `{key}`")))
    }
}

/// Releases its lock when dropped, so every exit path unlocks.
pub struct LockGuard<'a> {
    locksmith: &'a dyn Locksmith,
    token: Option<LockToken>,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(locksmith: &'a dyn Locksmith, key: &str) -> Result<Self> {
        let token = locksmith.lock(key)?;
        Ok(LockGuard {
            locksmith,
            token: Some(token),
        })
    }

    /// Release the lock now, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.locksmith.unlock(token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let key = token.key.clone();
            if let Err(err) = self.locksmith.unlock(token) {
                error!("failed to unlock {key}: {err}");
            }
        }
    }
}

/// Cross-process locks backed by `flock()` on files in a directory.
#[derive(Debug, Clone)]
pub struct FileLocksmith {
    locks_dir: PathBuf,
}

impl FileLocksmith {
    pub fn new(locks_dir: impl AsRef<Path>) -> Self {
        FileLocksmith {
            locks_dir: locks_dir.as_ref().to_path_buf(),
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir.join(format!("{key}.lock"))
    }
}

impl Locksmith for FileLocksmith {
    fn lock(&self, key: &str) -> Result<LockToken> {
        validate_key(key)?;
        let path = self.lock_path(key);
        debug!("acquiring lock {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|err| lock_error(key, err))?;

        loop {
            match flock(&file, FlockOperation::LockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(errno) => return Err(lock_error(key, errno.into())),
            }
        }

        debug!("acquired lock {}", path.display());
        Ok(LockToken {
            key: key.to_string(),
            file: Some(file),
        })
    }

    fn unlock(&self, token: LockToken) -> Result<()> {
        let Some(file) = token.file else {
            return Err(lock_error(
                &token.key,
                io::Error::other("token was not issued by a file locksmith"),
            ));
        };
        flock(&file, FlockOperation::Unlock).map_err(|errno| lock_error(&token.key, errno.into()))?;
        debug!("released lock {}", token.key);
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.lock_path(key);
        debug!("removing lock file {}", path.display());
        fs::remove_file(&path)
            .filter_not_found()
            .map_err(|err| lock_error(key, err))?;
        Ok(())
    }
}

/// In-process locks keyed by string.
#[derive(Debug, Default)]
pub struct MemoryLocksmith {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl MemoryLocksmith {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_locked(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

impl Locksmith for MemoryLocksmith {
    fn lock(&self, key: &str) -> Result<LockToken> {
        validate_key(key)?;
        let poisoned = || lock_error(key, io::Error::other("lock table poisoned"));

        let mut held = self.held.lock().map_err(|_| poisoned())?;
        while held.contains(key) {
            held = self.released.wait(held).map_err(|_| poisoned())?;
        }
        held.insert(key.to_string());
        Ok(LockToken {
            key: key.to_string(),
            file: None,
        })
    }

    fn unlock(&self, token: LockToken) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| lock_error(&token.key, io::Error::other("lock table poisoned")))?;
        if !held.remove(&token.key) {
            return Err(lock_error(&token.key, io::Error::other("lock is not held")));
        }
        self.released.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::test::tempdir;

    const BLOCKED: Duration = Duration::from_millis(200);

    /// Hold `key`, start a second locker on another thread, check that it is
    /// blocked, then release and check that it gets through.
    fn assert_exclusive(locksmith: Arc<dyn Locksmith>) {
        let token = locksmith.lock("some-key").unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = Arc::clone(&locksmith);
        let handle = thread::spawn(move || {
            let token = contender.lock("some-key").unwrap();
            tx.send(()).unwrap();
            contender.unlock(token).unwrap();
        });

        assert!(rx.recv_timeout(BLOCKED).is_err(), "second lock got through");

        // other keys are independent
        let other = locksmith.lock("other-key").unwrap();
        locksmith.unlock(other).unwrap();

        locksmith.unlock(token).unwrap();
        rx.recv_timeout(Duration::from_secs(10))
            .expect("second lock never acquired");
        handle.join().unwrap();
    }

    #[test]
    fn test_file_locks_are_exclusive() {
        let tmp = tempdir();
        assert_exclusive(Arc::new(FileLocksmith::new(tmp.path())));
        assert!(tmp.path().join("some-key.lock").exists());
    }

    #[test]
    fn test_forget_removes_the_lock_file() {
        let tmp = tempdir();
        let locksmith = FileLocksmith::new(tmp.path());
        let token = locksmith.lock("chain-abc").unwrap();
        locksmith.unlock(token).unwrap();
        assert!(tmp.path().join("chain-abc.lock").exists());

        locksmith.forget("chain-abc").unwrap();
        assert!(!tmp.path().join("chain-abc.lock").exists());
        // already gone
        locksmith.forget("chain-abc").unwrap();
        assert!(locksmith.forget("../escape").is_err());

        let token = locksmith.lock("chain-abc").unwrap();
        locksmith.unlock(token).unwrap();
    }

    #[test]
    fn test_memory_locks_are_exclusive() {
        assert_exclusive(Arc::new(MemoryLocksmith::new()));
    }

    #[test]
    fn test_dropping_the_token_releases_the_file_lock() {
        // Closing the descriptor is what happens when the holder dies.
        let tmp = tempdir();
        let locksmith = FileLocksmith::new(tmp.path());
        let token = locksmith.lock(GLOBAL_LOCK_KEY).unwrap();
        drop(token);
        let token = locksmith.lock(GLOBAL_LOCK_KEY).unwrap();
        locksmith.unlock(token).unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locksmith = MemoryLocksmith::new();
        {
            let _guard = LockGuard::acquire(&locksmith, GLOBAL_LOCK_KEY).unwrap();
            assert!(locksmith.is_locked(GLOBAL_LOCK_KEY));
        }
        assert!(!locksmith.is_locked(GLOBAL_LOCK_KEY));

        let guard = LockGuard::acquire(&locksmith, GLOBAL_LOCK_KEY).unwrap();
        guard.release().unwrap();
        assert!(!locksmith.is_locked(GLOBAL_LOCK_KEY));
    }

    #[test]
    fn test_invalid_keys() {
        let locksmith = MemoryLocksmith::new();
        for key in ["", "../escape", ".hidden", "a/b", "sha256:abc"] {
            assert!(locksmith.lock(key).is_err(), "{key}");
        }
    }

    #[test]
    fn test_missing_locks_dir() {
        let locksmith = FileLocksmith::new("/non/existing/locks");
        let err = locksmith.lock("some-key").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Lock);
    }

    #[test]
    fn test_unlocking_foreign_token() {
        let memory = MemoryLocksmith::new();
        let token = memory.lock("some-key").unwrap();
        let tmp = tempdir();
        assert!(FileLocksmith::new(tmp.path()).unlock(token).is_err());
    }
}

//! Counting the signatures made with each key.
//!
//! Keys are identified by the hex encoded SHA-256 hash of their public key,
//! see [`cert::key_hash`][crate::commons::crypto::cert::key_hash].

use std::{error, fmt};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::trace;
use serde::{Deserialize, Serialize};
use crate::commons::error::IoError;
use crate::commons::file;

const LOCK_FILE_NAME: &str = ".lock";


//------------ KeyUsageCounter -----------------------------------------------

#[derive(Debug)]
pub enum KeyUsageCounter {
    /// Counters kept in memory, lost on restart.
    Memory(Mutex<HashMap<String, u64>>),

    /// Counters kept as one JSON file per key in a directory.
    Disk(DiskCounter),
}

impl KeyUsageCounter {
    pub fn memory() -> Self {
        KeyUsageCounter::Memory(Mutex::new(HashMap::new()))
    }

    pub fn disk(dir: &Path) -> Result<Self, CounterError> {
        DiskCounter::new(dir).map(KeyUsageCounter::Disk)
    }

    /// Returns whether the key may be used once more.
    ///
    /// A negative limit means there is no limit.
    pub fn is_within_limit(
        &self, key_hash: &str, limit: i64
    ) -> Result<bool, CounterError> {
        if limit < 0 {
            return Ok(true)
        }
        Ok(self.get_count(key_hash)? < limit as u64)
    }

    /// Counts one more use of the key if that stays within the limit.
    ///
    /// Returns whether the count was increased. This is atomic: of any
    /// number of concurrent callers for the same key, never more than the
    /// limit succeed in total.
    pub fn increment_if_within_limit(
        &self, key_hash: &str, limit: i64
    ) -> Result<bool, CounterError> {
        let within = |count: u64| limit < 0 || count < limit as u64;
        match self {
            KeyUsageCounter::Memory(counters) => {
                let mut counters = counters.lock().unwrap();
                let count = counters.entry(key_hash.to_string()).or_insert(0);
                if within(*count) {
                    *count += 1;
                    Ok(true)
                }
                else {
                    Ok(false)
                }
            }
            KeyUsageCounter::Disk(disk) => {
                disk.update(key_hash, |count| {
                    within(count).then_some(count + 1)
                })
            }
        }
    }

    /// Returns the current count for a key, zero if it was never used.
    pub fn get_count(&self, key_hash: &str) -> Result<u64, CounterError> {
        match self {
            KeyUsageCounter::Memory(counters) => {
                Ok(counters.lock().unwrap().get(key_hash).copied().unwrap_or(0))
            }
            KeyUsageCounter::Disk(disk) => disk.get(key_hash),
        }
    }

    /// Sets the count for a key back to zero.
    pub fn reset(&self, key_hash: &str) -> Result<(), CounterError> {
        match self {
            KeyUsageCounter::Memory(counters) => {
                counters.lock().unwrap().remove(key_hash);
                Ok(())
            }
            KeyUsageCounter::Disk(disk) => {
                disk.update(key_hash, |_| Some(0)).map(|_| ())
            }
        }
    }
}


//------------ DiskCounter ---------------------------------------------------

/// Counters on disk, safe to share between processes.
///
/// Every update holds an exclusive lock on a lock file in the directory in
/// addition to the in-process mutex.
#[derive(Debug)]
pub struct DiskCounter {
    dir: PathBuf,
    lock: Mutex<FileLock>,
}

#[derive(Debug, Deserialize, Serialize)]
struct StoredCount {
    key_hash: String,
    count: u64,
}

impl DiskCounter {
    fn new(dir: &Path) -> Result<Self, CounterError> {
        file::create_dir_all(dir)?;
        Ok(DiskCounter {
            dir: dir.to_path_buf(),
            lock: Mutex::new(FileLock::create(dir)?),
        })
    }

    fn path(&self, key_hash: &str) -> Result<PathBuf, CounterError> {
        if key_hash.is_empty()
            || !key_hash.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(CounterError::InvalidKeyHash(key_hash.to_string()))
        }
        Ok(self.dir.join(format!("{key_hash}.json")))
    }

    fn read(&self, path: &Path) -> Result<u64, CounterError> {
        if !path.exists() {
            return Ok(0)
        }
        let stored: StoredCount = file::load_json(path)?;
        Ok(stored.count)
    }

    fn get(&self, key_hash: &str) -> Result<u64, CounterError> {
        let path = self.path(key_hash)?;
        let mut lock = self.lock.lock().unwrap();
        let _guard = lock.write()?;
        self.read(&path)
    }

    /// Updates a count under the lock.
    ///
    /// The operation returns the new count or `None` to leave it alone.
    fn update<F>(&self, key_hash: &str, op: F) -> Result<bool, CounterError>
    where F: FnOnce(u64) -> Option<u64> {
        let path = self.path(key_hash)?;
        let mut lock = self.lock.lock().unwrap();
        let _guard = lock.write()?;

        let count = self.read(&path)?;
        match op(count) {
            Some(new_count) => {
                file::save_json(
                    &StoredCount {
                        key_hash: key_hash.to_string(),
                        count: new_count,
                    },
                    &path
                )?;
                trace!("Key usage counter for {key_hash} now {new_count}");
                Ok(true)
            }
            None => Ok(false)
        }
    }
}


//------------ FileLock ------------------------------------------------------

#[derive(Debug)]
struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    fn create(dir: &Path) -> Result<Self, CounterError> {
        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true).truncate(false).read(true).write(true)
            .open(&lock_path)
            .map_err(|err| {
                IoError::new(
                    format!("failed to open lock file '{}'", lock_path.display()),
                    err
                )
            })?;
        Ok(FileLock { lock: fd_lock::RwLock::new(lock_file) })
    }

    fn write(
        &mut self
    ) -> Result<fd_lock::RwLockWriteGuard<'_, File>, CounterError> {
        self.lock.write().map_err(|err| {
            CounterError::Lock(format!("Cannot get file lock: {err}"))
        })
    }
}


//------------ CounterError --------------------------------------------------

#[derive(Debug)]
pub enum CounterError {
    Io(IoError),
    Lock(String),
    InvalidKeyHash(String),
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CounterError::Io(err) => write!(f, "key usage counter: {err}"),
            CounterError::Lock(msg) => write!(f, "key usage counter: {msg}"),
            CounterError::InvalidKeyHash(hash) => {
                write!(f, "invalid key hash: '{hash}'")
            }
        }
    }
}

impl error::Error for CounterError {}

impl From<IoError> for CounterError {
    fn from(err: IoError) -> Self {
        CounterError::Io(err)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use crate::test;

    const HASH: &str = "a3f1";

    fn concurrent_increments(counter: Arc<KeyUsageCounter>, n: usize, limit: i64) -> usize {
        let handles: Vec<_> = (0..n).map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                counter.increment_if_within_limit(HASH, limit).unwrap()
            })
        }).collect();
        handles.into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count()
    }

    #[test]
    fn memory_counter_is_atomic() {
        let counter = Arc::new(KeyUsageCounter::memory());
        assert_eq!(concurrent_increments(counter.clone(), 20, 7), 7);
        assert_eq!(counter.get_count(HASH).unwrap(), 7);
        assert!(!counter.is_within_limit(HASH, 7).unwrap());
        assert!(counter.is_within_limit(HASH, 8).unwrap());
    }

    #[test]
    fn unlimited() {
        let counter = Arc::new(KeyUsageCounter::memory());
        assert_eq!(concurrent_increments(counter.clone(), 10, -1), 10);
        assert!(counter.is_within_limit(HASH, -1).unwrap());
    }

    #[test]
    fn disk_counter_is_atomic_and_durable() {
        let dir = test::tmp_dir();
        let counter = Arc::new(KeyUsageCounter::disk(dir.path()).unwrap());
        assert_eq!(counter.get_count(HASH).unwrap(), 0);
        assert_eq!(concurrent_increments(counter.clone(), 12, 5), 5);
        drop(counter);

        let counter = KeyUsageCounter::disk(dir.path()).unwrap();
        assert_eq!(counter.get_count(HASH).unwrap(), 5);
        assert!(!counter.increment_if_within_limit(HASH, 5).unwrap());
        counter.reset(HASH).unwrap();
        assert!(counter.increment_if_within_limit(HASH, 5).unwrap());
        assert_eq!(counter.get_count(HASH).unwrap(), 1);
    }

    #[test]
    fn zero_limit_allows_nothing() {
        let counter = KeyUsageCounter::memory();
        assert!(!counter.is_within_limit(HASH, 0).unwrap());
        assert!(!counter.increment_if_within_limit(HASH, 0).unwrap());
    }

    #[test]
    fn key_hashes_must_be_hex() {
        let dir = test::tmp_dir();
        let counter = KeyUsageCounter::disk(dir.path()).unwrap();
        assert!(matches!(
            counter.get_count("../../etc/passwd"),
            Err(CounterError::InvalidKeyHash(_))
        ));
    }
}

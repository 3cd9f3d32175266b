// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::traits::{SecureKeyStore, SessionBlobStore};

/// Secure key store keeping all entries in memory.
///
/// Writes can be made to fail with [`MemoryKeyStore::fail_writes`] to simulate a broken backend,
/// or for single entries only with [`MemoryKeyStore::fail_writes_to`]. Clones share all state.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    failing_entries: Arc<RwLock<HashSet<String>>>,
    lock: Arc<Mutex<()>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including key indexes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lets every following write or delete of the named entry fail.
    pub fn fail_writes_to(&self, name: &str) {
        self.failing_entries
            .write()
            .expect("acquire exclusive write access on failing entries")
            .insert(name.to_owned());
    }

    fn check_writable(&self, name: &str) -> Result<(), MemoryStoreError> {
        let failing = self
            .failing_entries
            .read()
            .expect("acquire shared read access on failing entries")
            .contains(name);
        if failing || self.fail_writes.load(Ordering::SeqCst) {
            return Err(MemoryStoreError::Unavailable);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries
            .read()
            .expect("acquire shared read access on key store")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries
            .write()
            .expect("acquire exclusive write access on key store")
    }
}

impl SecureKeyStore for MemoryKeyStore {
    type Error = MemoryStoreError;

    fn write_lock(&self) -> Arc<Mutex<()>> {
        self.lock.clone()
    }

    fn exists(&self, name: &str) -> Result<bool, Self::Error> {
        Ok(self.read().contains_key(name))
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read().get(name).cloned())
    }

    fn store(&self, name: &str, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_writable(name)?;
        self.write().insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), Self::Error> {
        self.check_writable(name)?;
        self.write().remove(name);
        Ok(())
    }
}

type Suites = HashMap<String, HashMap<String, Vec<u8>>>;

/// Session blob store keeping all suites in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlobStore {
    suites: Arc<RwLock<Suites>>,
    fail_writes: Arc<AtomicBool>,
    lock: Arc<Mutex<()>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), MemoryStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MemoryStoreError::Unavailable);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Suites> {
        self.suites
            .read()
            .expect("acquire shared read access on blob store")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Suites> {
        self.suites
            .write()
            .expect("acquire exclusive write access on blob store")
    }
}

impl SessionBlobStore for MemoryBlobStore {
    type Error = MemoryStoreError;

    fn write_lock(&self) -> Arc<Mutex<()>> {
        self.lock.clone()
    }

    fn put(&self, suite: &str, key: &str, blob: &[u8]) -> Result<(), Self::Error> {
        self.check_writable()?;
        self.write()
            .entry(suite.to_owned())
            .or_default()
            .insert(key.to_owned(), blob.to_vec());
        Ok(())
    }

    fn get(&self, suite: &str, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self
            .read()
            .get(suite)
            .and_then(|blobs| blobs.get(key))
            .cloned())
    }

    fn get_all(&self, suite: &str) -> Result<HashMap<String, Vec<u8>>, Self::Error> {
        Ok(self.read().get(suite).cloned().unwrap_or_default())
    }

    fn remove(&self, suite: &str, key: &str) -> Result<(), Self::Error> {
        self.check_writable()?;
        if let Some(blobs) = self.write().get_mut(suite) {
            blobs.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("memory store is unavailable")]
    Unavailable,
}

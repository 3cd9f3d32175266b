// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

/// Persistent storage for secret key material, addressed by name.
///
/// Implementations are usually backed by a platform keychain or an encrypted file. Deleting an
/// entry which does not exist must succeed without error.
pub trait SecureKeyStore {
    type Error: Error + Send + Sync + 'static;

    /// Lock serializing read-modify-write sequences on this store.
    ///
    /// Every handle onto the same underlying storage must return the same lock, otherwise
    /// concurrent writers can lose updates of the key index.
    fn write_lock(&self) -> Arc<Mutex<()>>;

    fn exists(&self, name: &str) -> Result<bool, Self::Error>;

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    fn store(&self, name: &str, bytes: &[u8]) -> Result<(), Self::Error>;

    fn delete(&self, name: &str) -> Result<(), Self::Error>;
}

/// Small key-value persistence for session state, namespaced by "suite".
pub trait SessionBlobStore {
    type Error: Error + Send + Sync + 'static;

    /// Lock serializing read-modify-write sequences on this store, shared by every handle onto
    /// the same underlying storage.
    fn write_lock(&self) -> Arc<Mutex<()>>;

    fn put(&self, suite: &str, key: &str, blob: &[u8]) -> Result<(), Self::Error>;

    fn get(&self, suite: &str, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    fn get_all(&self, suite: &str) -> Result<HashMap<String, Vec<u8>>, Self::Error>;

    fn remove(&self, suite: &str, key: &str) -> Result<(), Self::Error>;
}

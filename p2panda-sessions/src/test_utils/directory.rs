// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::identity::IdentityId;
use crate::key_bundle::{PreKeyBundle, PreKeyId, SignedPreKey};
use crate::traits::IdentityDirectory;

#[derive(Debug, Default)]
struct Published {
    long_term: Option<SignedPreKey>,
    one_time: VecDeque<SignedPreKey>,
    exhausted: BTreeSet<PreKeyId>,
}

/// Identity directory shared by all participants of a test.
///
/// Hands out every one-time pre-key only once, in the order they were published. Can be taken
/// offline to simulate network failures.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    identities: Arc<RwLock<HashMap<IdentityId, Published>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of one-time pre-keys of `id` which were not handed out yet.
    pub fn available_one_time_keys(&self, id: &IdentityId) -> usize {
        self.read()
            .get(id)
            .map(|published| published.one_time.len())
            .unwrap_or_default()
    }

    pub fn long_term_key(&self, id: &IdentityId) -> Option<SignedPreKey> {
        self.read()
            .get(id)
            .and_then(|published| published.long_term.clone())
    }

    fn check_online(&self) -> Result<(), MemoryDirectoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MemoryDirectoryError::Offline);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<IdentityId, Published>> {
        self.identities
            .read()
            .expect("acquire shared read access on directory")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<IdentityId, Published>> {
        self.identities
            .write()
            .expect("acquire exclusive write access on directory")
    }
}

impl IdentityDirectory for MemoryDirectory {
    type Error = MemoryDirectoryError;

    fn fetch_prekey_bundle(&self, id: &IdentityId) -> Result<PreKeyBundle, Self::Error> {
        self.check_online()?;
        let mut identities = self.write();
        let published = identities
            .get_mut(id)
            .ok_or_else(|| MemoryDirectoryError::UnknownIdentity(id.clone()))?;
        let long_term = published
            .long_term
            .clone()
            .ok_or_else(|| MemoryDirectoryError::UnknownIdentity(id.clone()))?;

        let one_time = published.one_time.pop_front();
        if let Some(one_time) = &one_time {
            published.exhausted.insert(one_time.id());
        }

        Ok(PreKeyBundle::new(long_term, one_time))
    }

    fn publish_long_term_key(
        &self,
        owner: &IdentityId,
        key: SignedPreKey,
    ) -> Result<(), Self::Error> {
        self.check_online()?;
        self.write().entry(owner.clone()).or_default().long_term = Some(key);
        Ok(())
    }

    fn publish_one_time_keys(
        &self,
        owner: &IdentityId,
        keys: Vec<SignedPreKey>,
    ) -> Result<(), Self::Error> {
        self.check_online()?;
        self.write()
            .entry(owner.clone())
            .or_default()
            .one_time
            .extend(keys);
        Ok(())
    }

    fn exhausted_one_time_keys(
        &self,
        owner: &IdentityId,
        ids: &BTreeSet<PreKeyId>,
    ) -> Result<BTreeSet<PreKeyId>, Self::Error> {
        self.check_online()?;
        Ok(self
            .read()
            .get(owner)
            .map(|published| published.exhausted.intersection(ids).copied().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Error)]
pub enum MemoryDirectoryError {
    #[error("no pre-keys published for {0}")]
    UnknownIdentity(IdentityId),

    #[error("directory is offline")]
    Offline,
}

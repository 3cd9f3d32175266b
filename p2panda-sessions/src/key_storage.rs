// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle management of our own secret key material.
//!
//! Three kinds of secrets are kept: ephemeral keys of sessions we initiated, long-term pre-keys
//! which are rotated after a configured lifetime and one-time pre-keys which each serve exactly
//! one incoming session. Every secret is stored under a name derived by a [`KeyNaming`] strategy.
//!
//! Next to the secrets a [`KeyIndex`] is maintained per local identity. It is the only place
//! which enumerates which keys exist and is rewritten together with every added or removed key,
//! so garbage collection never needs to scan the underlying store.
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::crypto::x25519::SecretKey;
use crate::encoding::{EncodeError, decode_cbor, encode_cbor};
use crate::identity::IdentityId;
use crate::time::Timestamp;
use crate::traits::SecureKeyStore;

/// Kinds of secret key material managed by [`KeyStorage`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyKind {
    Ephemeral,
    LongTerm,
    OneTime,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Ephemeral => "ephemeral",
            KeyKind::LongTerm => "long-term",
            KeyKind::OneTime => "one-time",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry in the secure key store which needs a name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryName<'a> {
    /// Secret key of the given kind with its logical name.
    Key(KeyKind, &'a str),

    /// Key index of the local identity.
    Index,
}

/// Pure function mapping local identity and entry to the name used in the secure key store.
pub type KeyNaming = fn(&IdentityId, EntryName<'_>) -> String;

/// Default naming scheme: `<identity>.<kind>.<name>` for keys and `<identity>.index` for the
/// index.
pub fn default_key_naming(identity: &IdentityId, entry: EntryName<'_>) -> String {
    match entry {
        EntryName::Key(kind, name) => format!("{identity}.{kind}.{name}"),
        EntryName::Index => format!("{identity}.index"),
    }
}

/// Summary of all secret keys existing for a local identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndex {
    /// Names of long-term pre-keys with their creation time.
    long_term: BTreeMap<String, Timestamp>,
    one_time: BTreeSet<String>,
    ephemeral: BTreeSet<String>,
}

impl KeyIndex {
    pub fn long_term(&self) -> &BTreeMap<String, Timestamp> {
        &self.long_term
    }

    pub fn one_time(&self) -> &BTreeSet<String> {
        &self.one_time
    }

    pub fn ephemeral(&self) -> &BTreeSet<String> {
        &self.ephemeral
    }

    fn names(&self, kind: KeyKind) -> BTreeSet<String> {
        match kind {
            KeyKind::Ephemeral => self.ephemeral.clone(),
            KeyKind::LongTerm => self.long_term.keys().cloned().collect(),
            KeyKind::OneTime => self.one_time.clone(),
        }
    }

    fn contains(&self, kind: KeyKind, name: &str) -> bool {
        match kind {
            KeyKind::Ephemeral => self.ephemeral.contains(name),
            KeyKind::LongTerm => self.long_term.contains_key(name),
            KeyKind::OneTime => self.one_time.contains(name),
        }
    }

    fn insert(&mut self, kind: KeyKind, name: &str, created: Timestamp) {
        match kind {
            KeyKind::Ephemeral => {
                self.ephemeral.insert(name.to_owned());
            }
            KeyKind::LongTerm => {
                self.long_term.insert(name.to_owned(), created);
            }
            KeyKind::OneTime => {
                self.one_time.insert(name.to_owned());
            }
        }
    }

    fn remove(&mut self, kind: KeyKind, name: &str) {
        match kind {
            KeyKind::Ephemeral => {
                self.ephemeral.remove(name);
            }
            KeyKind::LongTerm => {
                self.long_term.remove(name);
            }
            KeyKind::OneTime => {
                self.one_time.remove(name);
            }
        }
    }
}

/// Number of keys deleted by a purge, per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub ephemeral: usize,
    pub long_term: usize,
    pub one_time: usize,
}

impl PurgeSummary {
    pub fn total(&self) -> usize {
        self.ephemeral + self.long_term + self.one_time
    }

    fn record(&mut self, kind: KeyKind) {
        match kind {
            KeyKind::Ephemeral => self.ephemeral += 1,
            KeyKind::LongTerm => self.long_term += 1,
            KeyKind::OneTime => self.one_time += 1,
        }
    }
}

/// Stores, looks up and garbage-collects secret keys of one local identity.
///
/// Read-modify-write sequences on the index are serialized with the write lock of the backing
/// store, so any number of handles on the same store can be used concurrently.
#[derive(Clone, Debug)]
pub struct KeyStorage<S> {
    store: S,
    identity: IdentityId,
    naming: KeyNaming,
    lock: Arc<Mutex<()>>,
}

impl<S> KeyStorage<S>
where
    S: SecureKeyStore,
{
    pub fn new(store: S, identity: IdentityId) -> Self {
        Self::with_naming(store, identity, default_key_naming)
    }

    pub fn with_naming(store: S, identity: IdentityId, naming: KeyNaming) -> Self {
        let lock = store.write_lock();
        Self {
            store,
            identity,
            naming,
            lock,
        }
    }

    /// Returns a handle for another local identity on the same backing store.
    pub fn for_identity(&self, identity: IdentityId) -> Self
    where
        S: Clone,
    {
        Self {
            store: self.store.clone(),
            identity,
            naming: self.naming,
            lock: self.lock.clone(),
        }
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn persist_ephemeral(&self, name: &str, secret: &SecretKey) -> KeyStorageResult<String> {
        self.persist(KeyKind::Ephemeral, name, secret, Timestamp::default())
    }

    pub fn persist_one_time(&self, name: &str, secret: &SecretKey) -> KeyStorageResult<String> {
        self.persist(KeyKind::OneTime, name, secret, Timestamp::default())
    }

    /// Stores a long-term pre-key secret, `created` is used to determine if it is still fresh.
    pub fn persist_long_term(
        &self,
        name: &str,
        secret: &SecretKey,
        created: Timestamp,
    ) -> KeyStorageResult<String> {
        self.persist(KeyKind::LongTerm, name, secret, created)
    }

    /// Loads a secret key, fails with [`KeyStorageError::KeyNotFound`] if it doesn't exist.
    pub fn get(&self, kind: KeyKind, name: &str) -> KeyStorageResult<SecretKey> {
        let bytes = self
            .store
            .load(&self.entry_name(EntryName::Key(kind, name)))
            .map_err(backend_error)?
            .ok_or_else(|| KeyStorageError::KeyNotFound {
                kind,
                name: name.to_owned(),
            })?;
        decode_cbor(&bytes).map_err(|err| {
            KeyStorageError::CorruptedState(format!("unreadable {kind} key {name}: {err}"))
        })
    }

    /// Returns true if a long-term pre-key exists which was created within `ttl` before `now`.
    pub fn has_fresh_long_term(&self, ttl: Duration, now: Timestamp) -> KeyStorageResult<bool> {
        let Some(index) = self.index()? else {
            return Ok(false);
        };
        let oldest_fresh = now.saturating_sub(ttl);
        Ok(index
            .long_term
            .values()
            .any(|created| *created >= oldest_fresh))
    }

    pub fn list_one_time_ids(&self) -> KeyStorageResult<BTreeSet<String>> {
        Ok(self.index()?.unwrap_or_default().one_time)
    }

    pub fn list_long_term(&self) -> KeyStorageResult<BTreeMap<String, Timestamp>> {
        Ok(self.index()?.unwrap_or_default().long_term)
    }

    pub fn list_ephemeral(&self) -> KeyStorageResult<BTreeSet<String>> {
        Ok(self.index()?.unwrap_or_default().ephemeral)
    }

    /// Returns the key index, `None` if no key was ever persisted for this identity.
    pub fn index(&self) -> KeyStorageResult<Option<KeyIndex>> {
        let Some(bytes) = self
            .store
            .load(&self.entry_name(EntryName::Index))
            .map_err(backend_error)?
        else {
            return Ok(None);
        };
        let index = decode_cbor(&bytes)
            .map_err(|err| KeyStorageError::CorruptedState(format!("unreadable key index: {err}")))?;
        Ok(Some(index))
    }

    /// Deletes a single key. Deleting a key which does not exist is not an error.
    pub fn remove(&self, kind: KeyKind, name: &str) -> KeyStorageResult<()> {
        let _guard = self.lock()?;
        self.delete_entry(kind, name)?;
        if let Some(mut index) = self.index()? {
            index.remove(kind, name);
            self.write_index(&index)?;
        }
        trace!(%kind, name, "removed key");
        Ok(())
    }

    /// Deletes every key not named in the keep-set of its kind and rewrites the index.
    ///
    /// If no index exists but we're asked to keep keys, the storage is in a state we can not
    /// reason about and nothing is deleted.
    pub fn purge(
        &self,
        keep_ephemeral: &BTreeSet<String>,
        keep_long_term: &BTreeSet<String>,
        keep_one_time: &BTreeSet<String>,
    ) -> KeyStorageResult<PurgeSummary> {
        self.purge_within(None, keep_ephemeral, keep_long_term, keep_one_time)
    }

    /// Like [`KeyStorage::purge`], but only deletes keys listed in `observed`.
    ///
    /// Keep-sets are usually computed from an earlier read of the index. Keys persisted since
    /// then are not part of `observed` and stay untouched.
    pub fn purge_observed(
        &self,
        observed: &KeyIndex,
        keep_ephemeral: &BTreeSet<String>,
        keep_long_term: &BTreeSet<String>,
        keep_one_time: &BTreeSet<String>,
    ) -> KeyStorageResult<PurgeSummary> {
        self.purge_within(Some(observed), keep_ephemeral, keep_long_term, keep_one_time)
    }

    fn purge_within(
        &self,
        observed: Option<&KeyIndex>,
        keep_ephemeral: &BTreeSet<String>,
        keep_long_term: &BTreeSet<String>,
        keep_one_time: &BTreeSet<String>,
    ) -> KeyStorageResult<PurgeSummary> {
        let _guard = self.lock()?;

        let Some(mut index) = self.index()? else {
            if keep_ephemeral.is_empty() && keep_long_term.is_empty() && keep_one_time.is_empty()
            {
                return Ok(PurgeSummary::default());
            }
            return Err(KeyStorageError::CorruptedState(
                "key index is missing while keys are expected to exist".into(),
            ));
        };

        let mut summary = PurgeSummary::default();
        for (kind, keep) in [
            (KeyKind::Ephemeral, keep_ephemeral),
            (KeyKind::LongTerm, keep_long_term),
            (KeyKind::OneTime, keep_one_time),
        ] {
            for name in index.names(kind) {
                let unobserved = observed.is_some_and(|observed| !observed.contains(kind, &name));
                if keep.contains(&name) || unobserved {
                    continue;
                }
                self.delete_entry(kind, &name)?;
                index.remove(kind, &name);
                summary.record(kind);
            }
        }

        self.write_index(&index)?;
        Ok(summary)
    }

    fn persist(
        &self,
        kind: KeyKind,
        name: &str,
        secret: &SecretKey,
        created: Timestamp,
    ) -> KeyStorageResult<String> {
        let _guard = self.lock()?;

        let entry_name = self.entry_name(EntryName::Key(kind, name));
        let previous = self.store.load(&entry_name).map_err(backend_error)?;
        self.store
            .store(&entry_name, &encode_cbor(secret)?)
            .map_err(backend_error)?;

        let mut index = self.index()?.unwrap_or_default();
        index.insert(kind, name, created);
        if let Err(err) = self.write_index(&index) {
            // Don't leave a key behind which the index doesn't know about and never lose a key
            // which was stored under that name before.
            let rollback = match previous {
                Some(bytes) => self.store.store(&entry_name, &bytes),
                None => self.store.delete(&entry_name),
            };
            if let Err(rollback_err) = rollback {
                warn!(%kind, name, "could not roll back key after failed index update: {rollback_err}");
            }
            return Err(err);
        }

        trace!(%kind, name, "persisted key");
        Ok(name.to_owned())
    }

    fn delete_entry(&self, kind: KeyKind, name: &str) -> KeyStorageResult<()> {
        let entry_name = self.entry_name(EntryName::Key(kind, name));
        if self.store.exists(&entry_name).map_err(backend_error)? {
            self.store.delete(&entry_name).map_err(backend_error)?;
        }
        Ok(())
    }

    fn write_index(&self, index: &KeyIndex) -> KeyStorageResult<()> {
        self.store
            .store(&self.entry_name(EntryName::Index), &encode_cbor(index)?)
            .map_err(backend_error)
    }

    fn entry_name(&self, entry: EntryName<'_>) -> String {
        (self.naming)(&self.identity, entry)
    }

    fn lock(&self) -> KeyStorageResult<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| KeyStorageError::LockPoisoned)
    }
}

fn backend_error<E: Error + Send + Sync + 'static>(err: E) -> KeyStorageError {
    KeyStorageError::Backend(Box::new(err))
}

pub type KeyStorageResult<T> = Result<T, KeyStorageError>;

#[derive(Debug, Error)]
pub enum KeyStorageError {
    #[error("{kind} key {name} not found")]
    KeyNotFound { kind: KeyKind, name: String },

    #[error("key storage is in a corrupted state: {0}")]
    CorruptedState(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("key storage lock is poisoned")]
    LockPoisoned,

    #[error("secure key store failed: {0}")]
    Backend(#[source] Box<dyn Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::identity::IdentityId;
    use crate::test_utils::MemoryKeyStore;
    use crate::time::Timestamp;
    use crate::traits::SecureKeyStore;

    use super::{EntryName, KeyKind, KeyStorage, KeyStorageError, default_key_naming};

    const DAY: Duration = Duration::from_secs(60 * 60 * 24);

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn persist_and_get() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeyStorage::new(MemoryKeyStore::new(), IdentityId::new("alice"));

        let secret = SecretKey::generate(&rng).unwrap();
        let name = keys.persist_ephemeral("eph-1", &secret).unwrap();
        assert_eq!(name, "eph-1");
        assert_eq!(keys.get(KeyKind::Ephemeral, "eph-1").unwrap(), secret);

        // Same name, different kind.
        assert_matches!(
            keys.get(KeyKind::OneTime, "eph-1"),
            Err(KeyStorageError::KeyNotFound { kind: KeyKind::OneTime, .. })
        );

        assert_eq!(keys.list_ephemeral().unwrap(), names(&["eph-1"]));
        assert!(keys.list_one_time_ids().unwrap().is_empty());
    }

    #[test]
    fn identities_are_separated() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();
        let alice = KeyStorage::new(store, IdentityId::new("alice"));
        let bob = alice.for_identity(IdentityId::new("bob"));

        alice
            .persist_one_time("ot-1", &SecretKey::generate(&rng).unwrap())
            .unwrap();

        assert!(bob.index().unwrap().is_none());
        assert!(bob.get(KeyKind::OneTime, "ot-1").is_err());
        assert_eq!(alice.list_one_time_ids().unwrap(), names(&["ot-1"]));
    }

    #[test]
    fn naming_strategy() {
        let identity = IdentityId::new("alice");
        assert_eq!(
            default_key_naming(&identity, EntryName::Key(KeyKind::LongTerm, "abc")),
            "alice.long-term.abc"
        );
        assert_eq!(default_key_naming(&identity, EntryName::Index), "alice.index");

        fn prefixed(identity: &IdentityId, entry: EntryName<'_>) -> String {
            format!("app/{}", default_key_naming(identity, entry))
        }

        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::with_naming(store.clone(), identity, prefixed);
        keys.persist_one_time("ot-1", &SecretKey::generate(&rng).unwrap())
            .unwrap();

        assert!(store.exists("app/alice.one-time.ot-1").unwrap());
        assert!(store.exists("app/alice.index").unwrap());
    }

    #[test]
    fn long_term_freshness() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeyStorage::new(MemoryKeyStore::new(), IdentityId::new("alice"));
        let now = Timestamp::from_nanos(100 * DAY.as_nanos() as u64);

        // Nothing stored yet.
        assert!(!keys.has_fresh_long_term(DAY, now).unwrap());

        // Stale key only.
        keys.persist_long_term(
            "lt-old",
            &SecretKey::generate(&rng).unwrap(),
            now.saturating_sub(DAY * 2),
        )
        .unwrap();
        assert!(!keys.has_fresh_long_term(DAY, now).unwrap());

        // Created exactly `ttl` ago is still fresh.
        keys.persist_long_term(
            "lt-new",
            &SecretKey::generate(&rng).unwrap(),
            now.saturating_sub(DAY),
        )
        .unwrap();
        assert!(keys.has_fresh_long_term(DAY, now).unwrap());
        assert!(
            !keys
                .has_fresh_long_term(DAY, now.saturating_add(Duration::from_nanos(1)))
                .unwrap()
        );
    }

    #[test]
    fn purge() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::new(store.clone(), IdentityId::new("alice"));

        for name in ["eph-1", "eph-2"] {
            keys.persist_ephemeral(name, &SecretKey::generate(&rng).unwrap())
                .unwrap();
        }
        for name in ["lt-1", "lt-2"] {
            keys.persist_long_term(name, &SecretKey::generate(&rng).unwrap(), Timestamp::now())
                .unwrap();
        }
        for name in ["ot-1", "ot-2", "ot-3"] {
            keys.persist_one_time(name, &SecretKey::generate(&rng).unwrap())
                .unwrap();
        }

        let summary = keys
            .purge(&names(&["eph-2"]), &names(&["lt-1"]), &names(&["ot-1", "ot-3"]))
            .unwrap();
        assert_eq!(summary.ephemeral, 1);
        assert_eq!(summary.long_term, 1);
        assert_eq!(summary.one_time, 1);
        assert_eq!(summary.total(), 3);

        assert_eq!(keys.list_ephemeral().unwrap(), names(&["eph-2"]));
        assert_eq!(
            keys.list_long_term().unwrap().into_keys().collect::<BTreeSet<_>>(),
            names(&["lt-1"])
        );
        assert_eq!(keys.list_one_time_ids().unwrap(), names(&["ot-1", "ot-3"]));

        // Secrets are gone from the backing store as well.
        assert!(!store.exists("alice.ephemeral.eph-1").unwrap());
        assert!(!store.exists("alice.long-term.lt-2").unwrap());
        assert!(!store.exists("alice.one-time.ot-2").unwrap());
        assert!(keys.get(KeyKind::OneTime, "ot-3").is_ok());

        // Purging again with the same keep-sets is a no-op.
        let summary = keys
            .purge(&names(&["eph-2"]), &names(&["lt-1"]), &names(&["ot-1", "ot-3"]))
            .unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn purge_leaves_keys_persisted_afterwards() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeyStorage::new(MemoryKeyStore::new(), IdentityId::new("alice"));

        keys.persist_one_time("ot-1", &SecretKey::generate(&rng).unwrap())
            .unwrap();
        let observed = keys.index().unwrap().unwrap();
        keys.persist_one_time("ot-2", &SecretKey::generate(&rng).unwrap())
            .unwrap();

        let summary = keys
            .purge_observed(&observed, &BTreeSet::new(), &BTreeSet::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(summary.one_time, 1);
        assert_eq!(keys.list_one_time_ids().unwrap(), names(&["ot-2"]));
    }

    #[test]
    fn purge_tolerates_already_deleted_entries() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::new(store.clone(), IdentityId::new("alice"));

        keys.persist_one_time("ot-1", &SecretKey::generate(&rng).unwrap())
            .unwrap();

        // Secret vanished behind our back, index still lists it.
        store.delete("alice.one-time.ot-1").unwrap();

        let summary = keys
            .purge(&BTreeSet::new(), &BTreeSet::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(summary.one_time, 1);
        assert!(keys.list_one_time_ids().unwrap().is_empty());

        // Single removal of an absent key is fine as well.
        keys.remove(KeyKind::Ephemeral, "does-not-exist").unwrap();
    }

    #[test]
    fn purge_without_index() {
        let keys = KeyStorage::new(MemoryKeyStore::new(), IdentityId::new("alice"));

        // Nothing to keep, nothing to do.
        assert_eq!(
            keys.purge(&BTreeSet::new(), &BTreeSet::new(), &BTreeSet::new())
                .unwrap()
                .total(),
            0
        );

        // Asked to keep keys which can't exist.
        assert_matches!(
            keys.purge(&BTreeSet::new(), &names(&["lt-1"]), &BTreeSet::new()),
            Err(KeyStorageError::CorruptedState(_))
        );
    }

    #[test]
    fn remove_single_key() {
        let rng = Rng::from_seed([1; 32]);
        let keys = KeyStorage::new(MemoryKeyStore::new(), IdentityId::new("alice"));

        keys.persist_ephemeral("eph-1", &SecretKey::generate(&rng).unwrap())
            .unwrap();
        keys.remove(KeyKind::Ephemeral, "eph-1").unwrap();

        assert!(keys.list_ephemeral().unwrap().is_empty());
        assert_matches!(
            keys.get(KeyKind::Ephemeral, "eph-1"),
            Err(KeyStorageError::KeyNotFound { .. })
        );
    }

    #[test]
    fn corrupted_index() {
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::new(store.clone(), IdentityId::new("alice"));

        store.store("alice.index", b"definitely not cbor").unwrap();
        assert_matches!(keys.index(), Err(KeyStorageError::CorruptedState(_)));
    }

    #[test]
    fn corrupted_key() {
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::new(store.clone(), IdentityId::new("alice"));

        store.store("alice.one-time.ot-1", b"\xff\x00").unwrap();
        assert_matches!(
            keys.get(KeyKind::OneTime, "ot-1"),
            Err(KeyStorageError::CorruptedState(_))
        );
    }

    #[test]
    fn failed_index_update_is_rolled_back() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();
        let keys = KeyStorage::new(store.clone(), IdentityId::new("alice"));

        let first = SecretKey::generate(&rng).unwrap();
        keys.persist_one_time("ot-1", &first).unwrap();

        store.fail_writes_to("alice.index");

        // New key is removed again.
        assert_matches!(
            keys.persist_one_time("ot-2", &SecretKey::generate(&rng).unwrap()),
            Err(KeyStorageError::Backend(_))
        );
        assert!(!store.exists("alice.one-time.ot-2").unwrap());

        // Key which existed under that name before is kept untouched.
        assert_matches!(
            keys.persist_one_time("ot-1", &SecretKey::generate(&rng).unwrap()),
            Err(KeyStorageError::Backend(_))
        );
        assert_eq!(keys.get(KeyKind::OneTime, "ot-1").unwrap(), first);
        assert_eq!(keys.list_one_time_ids().unwrap(), names(&["ot-1"]));
    }

    #[test]
    fn concurrent_handles_keep_index_complete() {
        const THREADS: usize = 4;
        const KEYS_PER_THREAD: usize = 50;

        let rng = Rng::from_seed([1; 32]);
        let store = MemoryKeyStore::new();

        let secrets: Vec<SecretKey> = (0..THREADS * KEYS_PER_THREAD)
            .map(|_| SecretKey::generate(&rng).unwrap())
            .collect();
        let one_time_names: BTreeSet<String> = (0..THREADS)
            .flat_map(|thread| (0..KEYS_PER_THREAD).map(move |i| format!("ot-{thread}-{i}")))
            .collect();

        KeyStorage::new(store.clone(), IdentityId::new("bob"))
            .persist_ephemeral("eph-initial", &secrets[0])
            .unwrap();

        std::thread::scope(|scope| {
            for (thread, secrets) in secrets.chunks(KEYS_PER_THREAD).enumerate() {
                // Every thread constructs its own handle onto the shared store.
                let keys = KeyStorage::new(store.clone(), IdentityId::new("bob"));
                scope.spawn(move || {
                    for (i, secret) in secrets.iter().enumerate() {
                        keys.persist_one_time(&format!("ot-{thread}-{i}"), secret)
                            .unwrap();
                        keys.persist_ephemeral(&format!("eph-{thread}-{i}"), secret)
                            .unwrap();
                    }
                });
            }

            // Garbage collection running at the same time drops all ephemeral keys.
            let keys = KeyStorage::new(store.clone(), IdentityId::new("bob"));
            let one_time_names = &one_time_names;
            scope.spawn(move || {
                for _ in 0..KEYS_PER_THREAD {
                    keys.purge(&BTreeSet::new(), &BTreeSet::new(), one_time_names)
                        .unwrap();
                }
            });
        });

        let keys = KeyStorage::new(store.clone(), IdentityId::new("bob"));
        let index = keys.index().unwrap().unwrap();
        assert_eq!(index.one_time(), &one_time_names);

        // Index and backing store agree on every key, nothing is orphaned.
        for name in index.ephemeral() {
            assert!(keys.get(KeyKind::Ephemeral, name).is_ok());
        }
        for name in index.one_time() {
            assert!(keys.get(KeyKind::OneTime, name).is_ok());
        }
        assert_eq!(
            store.len(),
            index.one_time().len() + index.ephemeral().len() + 1
        );
    }
}

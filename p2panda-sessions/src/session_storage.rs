// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted per-peer session records, one per local identity and peer.
//!
//! Records carry everything needed to re-run the handshake derivation after a restart, but
//! never the derived channel keys themselves. Which role a stored record belongs to is decided
//! by its shape when it is loaded.
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::x25519::PublicKey;
use crate::encoding::{EncodeError, decode_cbor, deserialize_hex, encode_cbor, serialize_hex};
use crate::identity::IdentityId;
use crate::key_bundle::{PreKeyId, SignedPreKey};
use crate::session::SessionId;
use crate::time::Timestamp;
use crate::traits::SessionBlobStore;

/// Everything the initiating side needs to recover a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitiatorRecord {
    pub session_id: SessionId,
    pub created: Timestamp,
    pub expires: Timestamp,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub additional_data: Vec<u8>,

    /// Name of our ephemeral secret in the key storage.
    pub ephemeral_key_name: String,
    pub peer_identity: PublicKey,
    pub peer_long_term_key: SignedPreKey,
    pub peer_one_time_key: Option<SignedPreKey>,
}

/// Everything the responding side needs to recover a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponderRecord {
    pub session_id: SessionId,
    pub created: Timestamp,
    pub expires: Timestamp,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub additional_data: Vec<u8>,
    pub peer_ephemeral_key: PublicKey,
    pub peer_identity: PublicKey,
    pub own_long_term_key_id: PreKeyId,
    pub own_one_time_key_id: Option<PreKeyId>,
}

/// Role which created a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Stored session of either role.
///
/// No tag is written, the two record types are told apart by their fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionRecord {
    Initiator(InitiatorRecord),
    Responder(ResponderRecord),
}

impl SessionRecord {
    pub fn role(&self) -> Role {
        match self {
            SessionRecord::Initiator(_) => Role::Initiator,
            SessionRecord::Responder(_) => Role::Responder,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            SessionRecord::Initiator(record) => record.session_id,
            SessionRecord::Responder(record) => record.session_id,
        }
    }

    pub fn created(&self) -> Timestamp {
        match self {
            SessionRecord::Initiator(record) => record.created,
            SessionRecord::Responder(record) => record.created,
        }
    }

    pub fn expires(&self) -> Timestamp {
        match self {
            SessionRecord::Initiator(record) => record.expires,
            SessionRecord::Responder(record) => record.expires,
        }
    }

    pub fn additional_data(&self) -> &[u8] {
        match self {
            SessionRecord::Initiator(record) => &record.additional_data,
            SessionRecord::Responder(record) => &record.additional_data,
        }
    }

    /// A record expiring exactly at `now` is still valid.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.is_after(&self.expires())
    }
}

impl From<InitiatorRecord> for SessionRecord {
    fn from(record: InitiatorRecord) -> Self {
        SessionRecord::Initiator(record)
    }
}

impl From<ResponderRecord> for SessionRecord {
    fn from(record: ResponderRecord) -> Self {
        SessionRecord::Responder(record)
    }
}

/// Session records of one local identity, keyed by peer identity id.
///
/// Writes are serialized with the write lock of the backing store, which is shared by all
/// handles onto it.
#[derive(Clone, Debug)]
pub struct SessionStorage<B> {
    store: B,
    suite: String,
    lock: Arc<Mutex<()>>,
}

impl<B> SessionStorage<B>
where
    B: SessionBlobStore,
{
    pub fn new(store: B, identity: &IdentityId) -> Self {
        let lock = store.write_lock();
        Self {
            store,
            suite: suite_name(identity),
            lock,
        }
    }

    /// Returns a handle for another local identity on the same backing store.
    pub fn for_identity(&self, identity: &IdentityId) -> Self
    where
        B: Clone,
    {
        Self {
            store: self.store.clone(),
            suite: suite_name(identity),
            lock: self.lock.clone(),
        }
    }

    /// Persists a record, replacing any previous record for this peer.
    pub fn save(&self, peer: &IdentityId, record: &SessionRecord) -> SessionStorageResult<()> {
        let _guard = self.lock()?;
        self.store
            .put(&self.suite, peer.as_str(), &encode_cbor(record)?)
            .map_err(backend_error)?;
        debug!(%peer, role = ?record.role(), session_id = %record.session_id(), "persisted session record");
        Ok(())
    }

    pub fn get(&self, peer: &IdentityId) -> SessionStorageResult<Option<SessionRecord>> {
        let Some(blob) = self
            .store
            .get(&self.suite, peer.as_str())
            .map_err(backend_error)?
        else {
            return Ok(None);
        };
        decode_record(peer, &blob).map(Some)
    }

    pub fn remove(&self, peer: &IdentityId) -> SessionStorageResult<()> {
        let _guard = self.lock()?;
        self.store
            .remove(&self.suite, peer.as_str())
            .map_err(backend_error)
    }

    pub fn remove_many<'a>(
        &self,
        peers: impl IntoIterator<Item = &'a IdentityId>,
    ) -> SessionStorageResult<()> {
        let _guard = self.lock()?;
        for peer in peers {
            self.store
                .remove(&self.suite, peer.as_str())
                .map_err(backend_error)?;
        }
        Ok(())
    }

    pub fn list_all(&self) -> SessionStorageResult<BTreeMap<IdentityId, SessionRecord>> {
        self.store
            .get_all(&self.suite)
            .map_err(backend_error)?
            .into_iter()
            .map(|(peer, blob)| {
                let peer = IdentityId::new(peer);
                let record = decode_record(&peer, &blob)?;
                Ok((peer, record))
            })
            .collect()
    }

    /// Drops all records which expired before `now` and returns their peers.
    pub fn expire_older_than(&self, now: Timestamp) -> SessionStorageResult<BTreeSet<IdentityId>> {
        let _guard = self.lock()?;

        let mut expired = BTreeSet::new();
        for (peer, blob) in self.store.get_all(&self.suite).map_err(backend_error)? {
            let peer = IdentityId::new(peer);
            if decode_record(&peer, &blob)?.is_expired(now) {
                expired.insert(peer);
            }
        }

        for peer in &expired {
            self.store
                .remove(&self.suite, peer.as_str())
                .map_err(backend_error)?;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired session records");
        }

        Ok(expired)
    }

    /// Removes every record of this local identity, readable or not. Returns how many there were.
    pub fn clear(&self) -> SessionStorageResult<usize> {
        let _guard = self.lock()?;
        let peers = self.store.get_all(&self.suite).map_err(backend_error)?;
        for peer in peers.keys() {
            self.store
                .remove(&self.suite, peer)
                .map_err(backend_error)?;
        }
        Ok(peers.len())
    }

    fn lock(&self) -> SessionStorageResult<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| SessionStorageError::LockPoisoned)
    }
}

fn suite_name(identity: &IdentityId) -> String {
    format!("sessions.{identity}")
}

fn decode_record(peer: &IdentityId, blob: &[u8]) -> SessionStorageResult<SessionRecord> {
    decode_cbor(blob).map_err(|_| SessionStorageError::CorruptedSessionRecord(peer.clone()))
}

fn backend_error<E: Error + Send + Sync + 'static>(err: E) -> SessionStorageError {
    SessionStorageError::Backend(Box::new(err))
}

pub type SessionStorageResult<T> = Result<T, SessionStorageError>;

#[derive(Debug, Error)]
pub enum SessionStorageError {
    #[error("stored session record for {0} has an unknown shape")]
    CorruptedSessionRecord(IdentityId),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("session storage lock is poisoned")]
    LockPoisoned,

    #[error("session blob store failed: {0}")]
    Backend(#[source] Box<dyn Error + Send + Sync>),
}

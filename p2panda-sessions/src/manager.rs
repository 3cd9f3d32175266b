// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point for applications: starts, accepts and recovers sessions and keeps our pre-keys in
//! order.
//!
//! The manager owns no session state itself. Everything needed to continue a session lives in
//! the session and key storages, so a manager can be dropped and re-created (for example after a
//! process restart) at any time.
//!
//! ## Garbage collection
//!
//! [`ChatManager::cleanup`] first drops expired session records and only then computes which
//! secret keys are still referenced by the remaining ones. Keys nobody references anymore are
//! purged, one-time pre-keys additionally only once the directory reports them as handed out. If
//! anything before the purge fails, no key is deleted.
use std::collections::BTreeSet;
use std::error::Error;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::crypto::xeddsa::XEdDSAError;
use crate::crypto::x25519::SecretKey;
use crate::crypto::{Rng, RngError};
use crate::identity::{Identity, IdentityId, LocalIdentity};
use crate::key_bundle::{KeyBundleError, PreKeyId, SignedPreKey};
use crate::key_storage::{KeyKind, KeyStorage, KeyStorageError, PurgeSummary};
use crate::message::WireMessage;
use crate::protocol::{
    EphemeralKey, InitiatorSession, ProtocolError, ResponderSession, SecureSession,
    SessionLifetime, ephemeral_key_name,
};
use crate::session_storage::{SessionRecord, SessionStorage, SessionStorageError};
use crate::time::{Clock, SystemClock};
use crate::traits::{IdentityDirectory, SecureKeyStore, SessionBlobStore};

/// Outcome of publishing pre-keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// A new long-term pre-key was generated and published.
    pub rotated_long_term: bool,

    /// Number of newly published one-time pre-keys.
    pub one_time_keys: usize,
}

/// Manages all two-party sessions of one local identity.
#[derive(Debug)]
pub struct ChatManager<S, B, D, C = SystemClock> {
    local: LocalIdentity,
    config: ManagerConfig,
    keys: KeyStorage<S>,
    sessions: SessionStorage<B>,
    directory: D,
    clock: C,
    rng: Rng,
}

impl<S, B, D> ChatManager<S, B, D, SystemClock>
where
    S: SecureKeyStore,
    B: SessionBlobStore + Clone,
    D: IdentityDirectory,
{
    pub fn new(local: LocalIdentity, key_store: S, blob_store: B, directory: D) -> Self {
        Self {
            keys: KeyStorage::new(key_store, local.id().clone()),
            sessions: SessionStorage::new(blob_store, local.id()),
            local,
            config: ManagerConfig::default(),
            directory,
            clock: SystemClock,
            rng: Rng::default(),
        }
    }
}

impl<S, B, D, C> ChatManager<S, B, D, C>
where
    S: SecureKeyStore,
    B: SessionBlobStore + Clone,
    D: IdentityDirectory,
    C: Clock,
{
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rng(mut self, rng: Rng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_clock<T: Clock>(self, clock: T) -> ChatManager<S, B, D, T> {
        ChatManager {
            local: self.local,
            config: self.config,
            keys: self.keys,
            sessions: self.sessions,
            directory: self.directory,
            clock,
            rng: self.rng,
        }
    }

    /// Manager for another local identity, sharing backends and storage locks with this one.
    pub fn for_identity(&self, local: LocalIdentity) -> Self
    where
        S: Clone,
        D: Clone,
        C: Clone,
    {
        Self {
            keys: self.keys.for_identity(local.id().clone()),
            sessions: self.sessions.for_identity(local.id()),
            local,
            config: self.config.clone(),
            directory: self.directory.clone(),
            clock: self.clock.clone(),
            rng: Rng::default(),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyStorage<S> {
        &self.keys
    }

    pub fn sessions(&self) -> &SessionStorage<B> {
        &self.sessions
    }

    pub fn rng(&self) -> &Rng {
        &self.rng
    }

    /// Prepares our pre-keys for incoming sessions after start-up. Cleans up first, so keys which
    /// became irrelevant are not counted towards the one-time pre-key target.
    pub fn initialize(&self) -> Result<PublishSummary, ManagerError> {
        self.cleanup()?;
        self.publish_prekeys()
    }

    /// Returns the session with `peer_id` from storage, if there is one we can still use.
    ///
    /// Expired sessions and sessions whose key material was deleted are treated as absent.
    pub fn active_session(
        &self,
        peer_id: &IdentityId,
    ) -> Result<Option<SecureSession<B>>, ManagerError> {
        let Some(record) = self.sessions.get(peer_id)? else {
            return Ok(None);
        };

        if record.is_expired(self.clock.now()) {
            debug!(peer = %peer_id, "stored session expired");
            return Ok(None);
        }

        match self.recover(peer_id, record) {
            Ok(session) => Ok(Some(session)),
            Err(ProtocolError::KeyStorage(KeyStorageError::KeyNotFound { kind, name })) => {
                warn!(peer = %peer_id, %kind, %name, "stored session lost its key material");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Starts a new session with `peer` using a freshly fetched and verified pre-key bundle.
    ///
    /// Nothing is persisted besides our new ephemeral key until the first message is encrypted
    /// with the returned session.
    pub fn start_new_session(
        &self,
        peer: &Identity,
        additional_data: &[u8],
    ) -> Result<InitiatorSession<B>, ManagerError> {
        let bundle = self
            .directory
            .fetch_prekey_bundle(peer.id())
            .map_err(directory_error)?;
        bundle.verify(peer.public_key())?;

        let secret = SecretKey::generate(&self.rng)?;
        let name = ephemeral_key_name(&secret.public_key());
        self.keys.persist_ephemeral(&name, &secret)?;

        debug!(
            peer = %peer.id(),
            one_time_key = bundle.one_time().is_some(),
            "starting new session"
        );

        Ok(InitiatorSession::new(
            self.local.clone(),
            peer.clone(),
            bundle,
            EphemeralKey { name, secret },
            additional_data.to_vec(),
            self.lifetime(),
            self.sessions.clone(),
        ))
    }

    /// Establishes or recovers the session a received message belongs to and decrypts it.
    ///
    /// An initiation message creates a new responder session, replacing any previous session
    /// with this peer. Key material only the replaced session referred to is deleted, so its
    /// initiation can't be accepted a second time. A re-delivered initiation of the current
    /// session is decrypted with the stored session and leaves its record untouched. A regular
    /// message needs a stored session with the same id.
    pub fn load_up_session(
        &self,
        peer: &Identity,
        json: &str,
        additional_data: &[u8],
    ) -> Result<(SecureSession<B>, Vec<u8>), ManagerError> {
        match WireMessage::from_json(json)? {
            WireMessage::Initiation(message) => {
                let previous = match self.sessions.get(peer.id()) {
                    Ok(record) => record,
                    Err(SessionStorageError::CorruptedSessionRecord(_)) => None,
                    Err(err) => return Err(err.into()),
                };

                let redelivered = match &previous {
                    Some(SessionRecord::Responder(record)) => {
                        record.peer_ephemeral_key == message.ephemeral_public_key
                            && record.peer_identity == *peer.public_key()
                            && record.additional_data == additional_data
                    }
                    _ => false,
                };
                if let (true, Some(record)) = (redelivered, previous.clone()) {
                    debug!(
                        peer = %peer.id(),
                        session_id = %record.session_id(),
                        "re-delivered initiation"
                    );
                    return self.decrypt_with_record(
                        peer,
                        record,
                        WireMessage::Initiation(message),
                    );
                }

                // The directory handed out one of our one-time pre-keys, replace it.
                self.publish_prekeys()?;

                let (session, plaintext) = ResponderSession::accept(
                    &self.local,
                    peer.clone(),
                    &message,
                    additional_data.to_vec(),
                    self.lifetime(),
                    &self.keys,
                    &self.sessions,
                )?;
                if let Some(previous) = previous {
                    self.release_replaced(previous, message.peer_one_time_card_id)?;
                }
                Ok((session.into(), plaintext))
            }
            WireMessage::Regular(message) => {
                let record = self
                    .sessions
                    .get(peer.id())?
                    .ok_or_else(|| ManagerError::SessionNotFound(peer.id().clone()))?;
                if record.session_id() != message.session_id {
                    return Err(ManagerError::SessionNotFound(peer.id().clone()));
                }
                self.decrypt_with_record(peer, record, WireMessage::Regular(message))
            }
        }
    }

    /// Drops expired sessions and purges all secret keys no remaining session refers to.
    pub fn cleanup(&self) -> Result<PurgeSummary, ManagerError> {
        let now = self.clock.now();
        let expired = self.sessions.expire_older_than(now)?;

        // Keys persisted while we're computing what to keep are not touched by the purge.
        let observed = self.keys.index()?.unwrap_or_default();

        let mut keep_ephemeral = BTreeSet::new();
        let mut keep_long_term = BTreeSet::new();
        let mut referenced_one_time = BTreeSet::new();
        for record in self.sessions.list_all()?.into_values() {
            match record {
                SessionRecord::Initiator(record) => {
                    keep_ephemeral.insert(record.ephemeral_key_name);
                }
                SessionRecord::Responder(record) => {
                    keep_long_term.insert(record.own_long_term_key_id.to_hex());
                    if let Some(id) = record.own_one_time_key_id {
                        referenced_one_time.insert(id.to_hex());
                    }
                }
            }
        }

        // Peers might still hold bundles with a rotated long-term pre-key for a while.
        let oldest_long_term = now.saturating_sub(
            self.config
                .long_term_key_ttl
                .saturating_add(self.config.expired_long_term_key_ttl),
        );
        for (name, created) in observed.long_term() {
            if *created >= oldest_long_term {
                keep_long_term.insert(name.clone());
            }
        }

        let local_one_time = observed.one_time();
        let exhausted = self
            .exhausted_one_time_keys(local_one_time)
            .inspect_err(|err| warn!("cleanup aborted, no keys were deleted: {err}"))?;
        let keep_one_time: BTreeSet<String> = local_one_time
            .difference(&exhausted)
            .cloned()
            .chain(referenced_one_time)
            .collect();

        let summary = self.keys.purge_observed(
            &observed,
            &keep_ephemeral,
            &keep_long_term,
            &keep_one_time,
        )?;
        info!(
            expired_sessions = expired.len(),
            ephemeral = summary.ephemeral,
            long_term = summary.long_term,
            one_time = summary.one_time,
            "cleaned up key material"
        );

        Ok(summary)
    }

    /// Rotates the long-term pre-key if none is fresh and tops up the published one-time
    /// pre-keys to the configured target.
    pub fn publish_prekeys(&self) -> Result<PublishSummary, ManagerError> {
        let rotated_long_term = if self
            .keys
            .has_fresh_long_term(self.config.long_term_key_ttl, self.clock.now())?
        {
            false
        } else {
            self.rotate_long_term_key()?;
            true
        };

        let local_one_time = self.keys.list_one_time_ids()?;
        let exhausted = self.exhausted_one_time_keys(&local_one_time)?;
        let unused = local_one_time.difference(&exhausted).count();
        let missing = self.config.one_time_keys_target.saturating_sub(unused);

        let mut prekeys = Vec::with_capacity(missing);
        for _ in 0..missing {
            let secret = SecretKey::generate(&self.rng)?;
            let prekey = SignedPreKey::sign(&secret, self.local.secret(), &self.rng)?;
            self.keys.persist_one_time(&prekey.id().to_hex(), &secret)?;
            prekeys.push(prekey);
        }

        if !prekeys.is_empty() {
            let names: Vec<String> = prekeys.iter().map(|prekey| prekey.id().to_hex()).collect();
            if let Err(err) = self
                .directory
                .publish_one_time_keys(self.local.id(), prekeys)
            {
                // Unpublished keys would otherwise count as available forever.
                for name in &names {
                    self.keys.remove(KeyKind::OneTime, name)?;
                }
                return Err(directory_error(err));
            }
        }

        let summary = PublishSummary {
            rotated_long_term,
            one_time_keys: missing,
        };
        info!(
            rotated_long_term,
            one_time_keys = missing,
            "published pre-keys"
        );

        Ok(summary)
    }

    /// Generates, stores and publishes a new long-term pre-key.
    pub fn rotate_long_term_key(&self) -> Result<SignedPreKey, ManagerError> {
        let secret = SecretKey::generate(&self.rng)?;
        let prekey = SignedPreKey::sign(&secret, self.local.secret(), &self.rng)?;
        let name = prekey.id().to_hex();
        self.keys
            .persist_long_term(&name, &secret, self.clock.now())?;

        if let Err(err) = self
            .directory
            .publish_long_term_key(self.local.id(), prekey.clone())
        {
            self.keys.remove(KeyKind::LongTerm, &name)?;
            return Err(directory_error(err));
        }

        debug!(id = %prekey.id(), "rotated long-term pre-key");
        Ok(prekey)
    }

    /// Ends the session with `peer_id`. The ephemeral key of a session we initiated is deleted
    /// right away, pre-keys are left to [`ChatManager::cleanup`].
    pub fn remove_session(&self, peer_id: &IdentityId) -> Result<(), ManagerError> {
        let record = match self.sessions.get(peer_id) {
            Ok(record) => record,
            Err(SessionStorageError::CorruptedSessionRecord(_)) => None,
            Err(err) => return Err(err.into()),
        };

        self.sessions.remove(peer_id)?;
        if let Some(SessionRecord::Initiator(record)) = record {
            self.keys
                .remove(KeyKind::Ephemeral, &record.ephemeral_key_name)?;
        }

        debug!(peer = %peer_id, "removed session");
        Ok(())
    }

    /// Removes all sessions and deletes all of our secret key material.
    ///
    /// Pre-keys already published in the directory stay there. Call
    /// [`ChatManager::initialize`] afterwards to publish new ones.
    pub fn reset(&self) -> Result<(), ManagerError> {
        let sessions = self.sessions.clear()?;
        let empty = BTreeSet::new();
        let summary = self.keys.purge(&empty, &empty, &empty)?;
        info!(sessions, keys = summary.total(), "reset all sessions");
        Ok(())
    }

    /// Recovers the session of a stored, unexpired record and decrypts a message with it.
    fn decrypt_with_record(
        &self,
        peer: &Identity,
        record: SessionRecord,
        message: WireMessage,
    ) -> Result<(SecureSession<B>, Vec<u8>), ManagerError> {
        let session_not_found = || ManagerError::SessionNotFound(peer.id().clone());
        if record.is_expired(self.clock.now()) {
            return Err(session_not_found());
        }

        let session = match self.recover(peer.id(), record) {
            Ok(session) => session,
            Err(ProtocolError::KeyStorage(KeyStorageError::KeyNotFound { .. })) => {
                return Err(session_not_found());
            }
            Err(err) => return Err(err.into()),
        };
        let plaintext = session.decrypt(&message)?;
        Ok((session, plaintext))
    }

    /// Deletes the key material a replaced session record referred to.
    ///
    /// The one-time pre-key of a replaced responder session is not needed anymore and deleting
    /// it makes sure the old initiation can't establish the session again.
    fn release_replaced(
        &self,
        replaced: SessionRecord,
        in_use: Option<PreKeyId>,
    ) -> Result<(), ManagerError> {
        match replaced {
            SessionRecord::Initiator(record) => {
                self.keys
                    .remove(KeyKind::Ephemeral, &record.ephemeral_key_name)?;
            }
            SessionRecord::Responder(record) => {
                if let Some(id) = record.own_one_time_key_id.filter(|id| Some(*id) != in_use) {
                    self.keys.remove(KeyKind::OneTime, &id.to_hex())?;
                }
            }
        }
        Ok(())
    }

    fn recover(
        &self,
        peer_id: &IdentityId,
        record: SessionRecord,
    ) -> Result<SecureSession<B>, ProtocolError> {
        match record {
            SessionRecord::Initiator(record) => InitiatorSession::recover(
                self.local.clone(),
                peer_id.clone(),
                record,
                &self.keys,
                self.sessions.clone(),
            )
            .map(SecureSession::from),
            SessionRecord::Responder(record) => {
                ResponderSession::recover(&self.local, peer_id.clone(), record, &self.keys)
                    .map(SecureSession::from)
            }
        }
    }

    /// Asks the directory which of the given one-time pre-keys were handed out already.
    fn exhausted_one_time_keys(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, ManagerError> {
        if names.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut owned = BTreeSet::new();
        for name in names {
            let id: PreKeyId = name.parse().map_err(|_| {
                KeyStorageError::CorruptedState(format!("invalid one-time pre-key name {name}"))
            })?;
            owned.insert(id);
        }

        let exhausted = self
            .directory
            .exhausted_one_time_keys(self.local.id(), &owned)
            .map_err(directory_error)?;
        Ok(exhausted.iter().map(PreKeyId::to_hex).collect())
    }

    fn lifetime(&self) -> SessionLifetime {
        let created = self.clock.now();
        SessionLifetime {
            created,
            expires: created.saturating_add(self.config.session_ttl),
        }
    }
}

fn directory_error<E: Error + Send + Sync + 'static>(err: E) -> ManagerError {
    ManagerError::Directory(Box::new(err))
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no usable session with {0} matches this message")]
    SessionNotFound(IdentityId),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("identity directory failed: {0}")]
    Directory(#[source] Box<dyn Error + Send + Sync>),

    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    KeyStorage(#[from] KeyStorageError),

    #[error(transparent)]
    SessionStorage(#[from] SessionStorageError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),
}

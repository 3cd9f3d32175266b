// SPDX-License-Identifier: MIT OR Apache-2.0

use tracing::debug;

use crate::crypto::Rng;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::x3dh::{Handshake, InitiatorKeys};
use crate::crypto::xeddsa::xeddsa_sign;
use crate::identity::{Identity, IdentityId, LocalIdentity};
use crate::key_bundle::{PreKeyBundle, PreKeyId};
use crate::key_storage::{KeyKind, KeyStorage};
use crate::message::{InitiationMessage, RegularMessage, WireMessage};
use crate::protocol::{ProtocolError, SessionLifetime, SessionState};
use crate::session::Session;
use crate::session_storage::{InitiatorRecord, SessionStorage};
use crate::traits::{SecureKeyStore, SessionBlobStore};

/// Our ephemeral key for one session and the name it is stored under.
#[derive(Clone, Debug)]
pub struct EphemeralKey {
    pub name: String,
    pub secret: SecretKey,
}

/// Session we started with a peer, based on their fetched pre-key bundle.
#[derive(Debug)]
pub struct InitiatorSession<B> {
    local: LocalIdentity,
    peer: Identity,
    bundle: PreKeyBundle,
    ephemeral: EphemeralKey,
    additional_data: Vec<u8>,
    lifetime: SessionLifetime,
    sessions: SessionStorage<B>,
    state: SessionState,
}

impl<B> InitiatorSession<B>
where
    B: SessionBlobStore,
{
    /// Prepares a new session. The bundle needs to be verified against the peer's identity key
    /// already, derivation is deferred until the first message is encrypted.
    pub fn new(
        local: LocalIdentity,
        peer: Identity,
        bundle: PreKeyBundle,
        ephemeral: EphemeralKey,
        additional_data: Vec<u8>,
        lifetime: SessionLifetime,
        sessions: SessionStorage<B>,
    ) -> Self {
        Self {
            local,
            peer,
            bundle,
            ephemeral,
            additional_data,
            lifetime,
            sessions,
            state: SessionState::Uninitialized,
        }
    }

    /// Re-establishes a session from its persisted record, using the stored ephemeral secret.
    pub fn recover<S>(
        local: LocalIdentity,
        peer_id: IdentityId,
        record: InitiatorRecord,
        keys: &KeyStorage<S>,
        sessions: SessionStorage<B>,
    ) -> Result<Self, ProtocolError>
    where
        S: SecureKeyStore,
    {
        let secret = keys.get(KeyKind::Ephemeral, &record.ephemeral_key_name)?;
        let mut session = Self {
            local,
            peer: Identity::new(peer_id, record.peer_identity),
            bundle: PreKeyBundle::new(record.peer_long_term_key, record.peer_one_time_key),
            ephemeral: EphemeralKey {
                name: record.ephemeral_key_name,
                secret,
            },
            additional_data: record.additional_data,
            lifetime: SessionLifetime {
                created: record.created,
                expires: record.expires,
            },
            sessions,
            state: SessionState::Uninitialized,
        };

        let derived = session.derive()?;
        if derived.id() != record.session_id {
            return Err(ProtocolError::SessionMismatch {
                expected: record.session_id,
                received: derived.id(),
            });
        }
        debug!(peer = %session.peer.id(), session_id = %derived.id(), "recovered initiator session");
        session.state = SessionState::Initialized(derived);

        Ok(session)
    }

    pub fn peer_id(&self) -> &IdentityId {
        self.peer.id()
    }

    pub fn additional_data(&self) -> &[u8] {
        &self.additional_data
    }

    pub fn lifetime(&self) -> SessionLifetime {
        self.lifetime
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn ephemeral_key_name(&self) -> &str {
        &self.ephemeral.name
    }

    /// Encrypts a message for the peer.
    ///
    /// The first call runs the handshake derivation, persists the session record and returns an
    /// [`InitiationMessage`]. All later calls return a [`RegularMessage`].
    pub fn encrypt(&mut self, plaintext: &[u8], rng: &Rng) -> Result<WireMessage, ProtocolError> {
        if let SessionState::Initialized(session) = &self.state {
            let (salt, ciphertext) = session.encrypt(plaintext, rng)?;
            return Ok(RegularMessage {
                session_id: session.id(),
                salt,
                ciphertext,
            }
            .into());
        }

        let session = self.derive()?;
        let (salt, ciphertext) = session.encrypt(plaintext, rng)?;
        let ephemeral_public_key = self.ephemeral.secret.public_key();
        let signature = xeddsa_sign(ephemeral_public_key.as_bytes(), self.local.secret(), rng)?;

        self.sessions.save(self.peer.id(), &self.record(&session).into())?;
        debug!(peer = %self.peer.id(), session_id = %session.id(), "initiated session");

        let message = InitiationMessage {
            sender_identity_id: self.local.id().clone(),
            peer_long_term_card_id: self.bundle.long_term().id(),
            peer_one_time_card_id: self.bundle.one_time().map(|one_time| one_time.id()),
            ephemeral_public_key,
            ephemeral_public_key_signature: signature,
            salt,
            ciphertext,
        };
        self.state = SessionState::Initialized(session);

        Ok(message.into())
    }

    pub fn decrypt(&self, message: &RegularMessage) -> Result<Vec<u8>, ProtocolError> {
        let session = self.state.session()?;
        if message.session_id != session.id() {
            return Err(ProtocolError::SessionMismatch {
                expected: session.id(),
                received: message.session_id,
            });
        }
        Ok(session.decrypt(&message.salt, &message.ciphertext)?)
    }

    fn derive(&self) -> Result<Session, ProtocolError> {
        let handshake = Handshake::Initiator(InitiatorKeys {
            our_identity_secret: self.local.secret(),
            our_ephemeral_secret: &self.ephemeral.secret,
            their_identity_key: self.peer.public_key(),
            their_long_term_key: self.bundle.long_term().key(),
            their_one_time_key: self.bundle.one_time().map(|one_time| one_time.key()),
        });
        Ok(Session::derive(&handshake, &self.additional_data)?)
    }

    fn record(&self, session: &Session) -> InitiatorRecord {
        InitiatorRecord {
            session_id: session.id(),
            created: self.lifetime.created,
            expires: self.lifetime.expires,
            additional_data: self.additional_data.clone(),
            ephemeral_key_name: self.ephemeral.name.clone(),
            peer_identity: *self.peer.public_key(),
            peer_long_term_key: self.bundle.long_term().clone(),
            peer_one_time_key: self.bundle.one_time().cloned(),
        }
    }
}

/// Name an ephemeral key is stored under, derived from its public key.
pub(crate) fn ephemeral_key_name(public_key: &PublicKey) -> String {
    PreKeyId::from_public_key(public_key).to_hex()
}

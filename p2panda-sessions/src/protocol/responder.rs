// SPDX-License-Identifier: MIT OR Apache-2.0

use tracing::{debug, warn};

use crate::crypto::Rng;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::x3dh::{Handshake, ResponderKeys};
use crate::crypto::xeddsa::xeddsa_verify;
use crate::identity::{Identity, IdentityId, LocalIdentity};
use crate::key_bundle::PreKeyId;
use crate::key_storage::{KeyKind, KeyStorage, KeyStorageError};
use crate::message::{InitiationMessage, RegularMessage};
use crate::protocol::{ProtocolError, SessionLifetime, SessionState};
use crate::session::Session;
use crate::session_storage::{ResponderRecord, SessionStorage};
use crate::traits::{SecureKeyStore, SessionBlobStore};

/// Session a peer started with us.
#[derive(Debug)]
pub struct ResponderSession {
    peer: Identity,
    peer_ephemeral_key: PublicKey,
    additional_data: Vec<u8>,
    lifetime: SessionLifetime,
    state: SessionState,
}

impl ResponderSession {
    /// Accepts the first message of a session and returns it decrypted.
    ///
    /// The message needs to be signed by the identity we expect it from and reference pre-keys
    /// we still hold. Nothing is persisted unless the first ciphertext could be decrypted.
    pub fn accept<S, B>(
        local: &LocalIdentity,
        peer: Identity,
        message: &InitiationMessage,
        additional_data: Vec<u8>,
        lifetime: SessionLifetime,
        keys: &KeyStorage<S>,
        sessions: &SessionStorage<B>,
    ) -> Result<(Self, Vec<u8>), ProtocolError>
    where
        S: SecureKeyStore,
        B: SessionBlobStore,
    {
        xeddsa_verify(
            message.ephemeral_public_key.as_bytes(),
            peer.public_key(),
            &message.ephemeral_public_key_signature,
        )
        .map_err(|_| ProtocolError::VerificationFailed(peer.id().clone()))?;

        if &message.sender_identity_id != peer.id() {
            return Err(ProtocolError::IdentityMismatch {
                expected: peer.id().clone(),
                received: message.sender_identity_id.clone(),
            });
        }

        let (long_term_secret, one_time_secret) = load_pre_keys(
            keys,
            &message.peer_long_term_card_id,
            message.peer_one_time_card_id.as_ref(),
        )
        .inspect_err(|err| {
            if let ProtocolError::KeyStorage(KeyStorageError::KeyNotFound { kind, name }) = err {
                warn!(peer = %peer.id(), %kind, %name, "initiation references unknown pre-key");
            }
        })?;

        let session = derive(
            local,
            peer.public_key(),
            &message.ephemeral_public_key,
            &long_term_secret,
            one_time_secret.as_ref(),
            &additional_data,
        )?;
        let plaintext = session.decrypt(&message.salt, &message.ciphertext)?;

        let record = ResponderRecord {
            session_id: session.id(),
            created: lifetime.created,
            expires: lifetime.expires,
            additional_data: additional_data.clone(),
            peer_ephemeral_key: message.ephemeral_public_key,
            peer_identity: *peer.public_key(),
            own_long_term_key_id: message.peer_long_term_card_id,
            own_one_time_key_id: message.peer_one_time_card_id,
        };
        sessions.save(peer.id(), &record.into())?;
        debug!(peer = %peer.id(), session_id = %session.id(), "accepted session");

        Ok((
            Self {
                peer,
                peer_ephemeral_key: message.ephemeral_public_key,
                additional_data,
                lifetime,
                state: SessionState::Initialized(session),
            },
            plaintext,
        ))
    }

    /// Re-establishes a session from its persisted record, using our stored pre-keys.
    pub fn recover<S>(
        local: &LocalIdentity,
        peer_id: IdentityId,
        record: ResponderRecord,
        keys: &KeyStorage<S>,
    ) -> Result<Self, ProtocolError>
    where
        S: SecureKeyStore,
    {
        let (long_term_secret, one_time_secret) = load_pre_keys(
            keys,
            &record.own_long_term_key_id,
            record.own_one_time_key_id.as_ref(),
        )?;

        let session = derive(
            local,
            &record.peer_identity,
            &record.peer_ephemeral_key,
            &long_term_secret,
            one_time_secret.as_ref(),
            &record.additional_data,
        )?;
        if session.id() != record.session_id {
            return Err(ProtocolError::SessionMismatch {
                expected: record.session_id,
                received: session.id(),
            });
        }
        debug!(peer = %peer_id, session_id = %session.id(), "recovered responder session");

        Ok(Self {
            peer: Identity::new(peer_id, record.peer_identity),
            peer_ephemeral_key: record.peer_ephemeral_key,
            additional_data: record.additional_data,
            lifetime: SessionLifetime {
                created: record.created,
                expires: record.expires,
            },
            state: SessionState::Initialized(session),
        })
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

    pub fn encrypt(&self, plaintext: &[u8], rng: &Rng) -> Result<RegularMessage, ProtocolError> {
        let session = self.state.session()?;
        let (salt, ciphertext) = session.encrypt(plaintext, rng)?;
        Ok(RegularMessage {
            session_id: session.id(),
            salt,
            ciphertext,
        })
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

    /// Decrypts a re-delivered initiation message of this session.
    pub fn decrypt_initiation(&self, message: &InitiationMessage) -> Result<Vec<u8>, ProtocolError> {
        let session = self.state.session()?;
        if message.ephemeral_public_key != self.peer_ephemeral_key
            || &message.sender_identity_id != self.peer.id()
        {
            return Err(ProtocolError::UnexpectedInitiation);
        }
        Ok(session.decrypt(&message.salt, &message.ciphertext)?)
    }
}

fn load_pre_keys<S: SecureKeyStore>(
    keys: &KeyStorage<S>,
    long_term_id: &PreKeyId,
    one_time_id: Option<&PreKeyId>,
) -> Result<(SecretKey, Option<SecretKey>), ProtocolError> {
    let long_term = keys.get(KeyKind::LongTerm, &long_term_id.to_hex())?;
    let one_time = one_time_id
        .map(|id| keys.get(KeyKind::OneTime, &id.to_hex()))
        .transpose()?;
    Ok((long_term, one_time))
}

fn derive(
    local: &LocalIdentity,
    their_identity_key: &PublicKey,
    their_ephemeral_key: &PublicKey,
    long_term_secret: &SecretKey,
    one_time_secret: Option<&SecretKey>,
    additional_data: &[u8],
) -> Result<Session, ProtocolError> {
    let handshake = Handshake::Responder(ResponderKeys {
        our_identity_secret: local.secret(),
        our_long_term_secret: long_term_secret,
        our_one_time_secret: one_time_secret,
        their_identity_key,
        their_ephemeral_key,
    });
    Ok(Session::derive(&handshake, additional_data)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::identity::{IdentityId, LocalIdentity};
    use crate::key_bundle::{PreKeyBundle, SignedPreKey};
    use crate::key_storage::{KeyKind, KeyStorage, KeyStorageError};
    use crate::message::{InitiationMessage, WireMessage};
    use crate::protocol::{
        EphemeralKey, InitiatorSession, ProtocolError, SessionLifetime, ephemeral_key_name,
    };
    use crate::session_storage::{SessionRecord, SessionStorage};
    use crate::test_utils::{MemoryBlobStore, MemoryKeyStore};
    use crate::time::Timestamp;

    use super::ResponderSession;

    struct Bob {
        identity: LocalIdentity,
        keys: KeyStorage<MemoryKeyStore>,
        sessions: SessionStorage<MemoryBlobStore>,
        bundle: PreKeyBundle,
    }

    fn lifetime() -> SessionLifetime {
        let created = Timestamp::from_nanos(1_000);
        SessionLifetime {
            created,
            expires: created.saturating_add(Duration::from_secs(60)),
        }
    }

    fn bob(rng: &Rng) -> Bob {
        let identity = LocalIdentity::new(IdentityId::new("bob"), SecretKey::generate(rng).unwrap());
        let keys = KeyStorage::new(MemoryKeyStore::new(), identity.id().clone());
        let sessions = SessionStorage::new(MemoryBlobStore::new(), identity.id());

        let long_term_secret = SecretKey::generate(rng).unwrap();
        let long_term = SignedPreKey::sign(&long_term_secret, identity.secret(), rng).unwrap();
        keys.persist_long_term(&long_term.id().to_hex(), &long_term_secret, Timestamp::from_nanos(0))
            .unwrap();

        let one_time_secret = SecretKey::generate(rng).unwrap();
        let one_time = SignedPreKey::sign(&one_time_secret, identity.secret(), rng).unwrap();
        keys.persist_one_time(&one_time.id().to_hex(), &one_time_secret)
            .unwrap();

        Bob {
            identity,
            keys,
            sessions,
            bundle: PreKeyBundle::new(long_term, Some(one_time)),
        }
    }

    fn initiation(rng: &Rng, alice: &LocalIdentity, bob: &Bob) -> InitiationMessage {
        let secret = SecretKey::generate(rng).unwrap();
        let mut session = InitiatorSession::new(
            alice.clone(),
            bob.identity.identity().clone(),
            bob.bundle.clone(),
            EphemeralKey {
                name: ephemeral_key_name(&secret.public_key()),
                secret,
            },
            Vec::new(),
            lifetime(),
            SessionStorage::new(MemoryBlobStore::new(), alice.id()),
        );
        match session.encrypt(b"hi", rng).unwrap() {
            WireMessage::Initiation(message) => message,
            WireMessage::Regular(_) => panic!("expected initiation message"),
        }
    }

    #[test]
    fn accept_and_recover() {
        let rng = Rng::from_seed([1; 32]);
        let alice = LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let bob = bob(&rng);

        let message = initiation(&rng, &alice, &bob);
        let (session, plaintext) = ResponderSession::accept(
            &bob.identity,
            alice.identity().clone(),
            &message,
            Vec::new(),
            lifetime(),
            &bob.keys,
            &bob.sessions,
        )
        .unwrap();
        assert_eq!(plaintext, b"hi");
        assert_eq!(session.decrypt_initiation(&message).unwrap(), b"hi");

        let Some(SessionRecord::Responder(record)) = bob.sessions.get(alice.id()).unwrap() else {
            panic!("expected responder record");
        };
        assert_eq!(record.own_long_term_key_id, bob.bundle.long_term().id());
        assert_eq!(
            record.own_one_time_key_id,
            bob.bundle.one_time().map(|one_time| one_time.id())
        );

        let recovered =
            ResponderSession::recover(&bob.identity, alice.id().clone(), record, &bob.keys)
                .unwrap();
        assert_eq!(recovered.state(), session.state());
    }

    #[test]
    fn reject_forged_ephemeral_key() {
        let rng = Rng::from_seed([1; 32]);
        let alice = LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let mallory =
            LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let bob = bob(&rng);

        // Signed by a different identity key than the one we expect.
        let message = initiation(&rng, &mallory, &bob);
        assert_matches!(
            ResponderSession::accept(
                &bob.identity,
                alice.identity().clone(),
                &message,
                Vec::new(),
                lifetime(),
                &bob.keys,
                &bob.sessions,
            ),
            Err(ProtocolError::VerificationFailed(_))
        );
        assert!(bob.sessions.get(alice.id()).unwrap().is_none());
    }

    #[test]
    fn reject_wrong_sender() {
        let rng = Rng::from_seed([1; 32]);
        let alice = LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let bob = bob(&rng);

        let mut message = initiation(&rng, &alice, &bob);
        message.sender_identity_id = IdentityId::new("charlie");

        assert_matches!(
            ResponderSession::accept(
                &bob.identity,
                alice.identity().clone(),
                &message,
                Vec::new(),
                lifetime(),
                &bob.keys,
                &bob.sessions,
            ),
            Err(ProtocolError::IdentityMismatch { expected, received })
                if expected.as_str() == "alice" && received.as_str() == "charlie"
        );
    }

    #[test]
    fn consumed_one_time_key() {
        let rng = Rng::from_seed([1; 32]);
        let alice = LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let bob = bob(&rng);

        let message = initiation(&rng, &alice, &bob);
        let one_time_id = message.peer_one_time_card_id.unwrap();
        bob.keys
            .remove(KeyKind::OneTime, &one_time_id.to_hex())
            .unwrap();

        assert_matches!(
            ResponderSession::accept(
                &bob.identity,
                alice.identity().clone(),
                &message,
                Vec::new(),
                lifetime(),
                &bob.keys,
                &bob.sessions,
            ),
            Err(ProtocolError::KeyStorage(KeyStorageError::KeyNotFound {
                kind: KeyKind::OneTime,
                ..
            }))
        );
        assert!(bob.sessions.get(alice.id()).unwrap().is_none());
    }

    #[test]
    fn mismatching_additional_data() {
        let rng = Rng::from_seed([1; 32]);
        let alice = LocalIdentity::new(IdentityId::new("alice"), SecretKey::generate(&rng).unwrap());
        let bob = bob(&rng);

        let message = initiation(&rng, &alice, &bob);
        assert_matches!(
            ResponderSession::accept(
                &bob.identity,
                alice.identity().clone(),
                &message,
                b"other context".to_vec(),
                lifetime(),
                &bob.keys,
                &bob.sessions,
            ),
            Err(ProtocolError::Session(_))
        );
        assert!(bob.sessions.get(alice.id()).unwrap().is_none());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) handshake derivation.
//!
//! Both roles combine their identity key, the initiator's ephemeral key and the responder's
//! long-term (and optionally one-time) pre-key into the same shared secret. The secret is
//! expanded into a session id and two channel keys, one per direction.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::Secret;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey, X25519Error};

/// ASCII string identifying the application, used as KDF info prefix.
const KDF_INFO: &[u8] = b"p2panda-sessions";

pub const SESSION_ID_SIZE: usize = 32;

pub const CHANNEL_KEY_SIZE: usize = 32;

const OKM_SIZE: usize = SESSION_ID_SIZE + 2 * CHANNEL_KEY_SIZE;

/// Key material of the party starting the session.
pub struct InitiatorKeys<'a> {
    pub our_identity_secret: &'a SecretKey,
    pub our_ephemeral_secret: &'a SecretKey,
    pub their_identity_key: &'a PublicKey,
    pub their_long_term_key: &'a PublicKey,
    pub their_one_time_key: Option<&'a PublicKey>,
}

/// Key material of the party reacting to an initiation.
pub struct ResponderKeys<'a> {
    pub our_identity_secret: &'a SecretKey,
    pub our_long_term_secret: &'a SecretKey,
    pub our_one_time_secret: Option<&'a SecretKey>,
    pub their_identity_key: &'a PublicKey,
    pub their_ephemeral_key: &'a PublicKey,
}

pub enum Handshake<'a> {
    Initiator(InitiatorKeys<'a>),
    Responder(ResponderKeys<'a>),
}

/// Output of a completed handshake, identical on both sides.
pub struct HandshakeSecrets {
    pub session_id: [u8; SESSION_ID_SIZE],

    /// Key for messages sent by the initiator.
    pub initiator_key: Secret<CHANNEL_KEY_SIZE>,

    /// Key for messages sent by the responder.
    pub responder_key: Secret<CHANNEL_KEY_SIZE>,
}

/// Runs the handshake derivation for either role.
///
/// `additional_data` is bound into the derived secrets, both parties need to supply the same
/// bytes to arrive at the same session.
pub fn x3dh_derive(
    handshake: &Handshake<'_>,
    additional_data: &[u8],
) -> Result<HandshakeSecrets, X3dhError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(PUBLIC_KEY_SIZE * 5));
    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    let (initiator_identity, responder_identity) = match handshake {
        Handshake::Initiator(keys) => {
            // DH1 = DH(IKA, SPKB)
            ikm.extend_from_slice(
                &keys
                    .our_identity_secret
                    .calculate_agreement(keys.their_long_term_key)?,
            );
            // DH2 = DH(EKA, IKB)
            ikm.extend_from_slice(
                &keys
                    .our_ephemeral_secret
                    .calculate_agreement(keys.their_identity_key)?,
            );
            // DH3 = DH(EKA, SPKB)
            ikm.extend_from_slice(
                &keys
                    .our_ephemeral_secret
                    .calculate_agreement(keys.their_long_term_key)?,
            );
            // DH4 = DH(EKA, OPKB)
            if let Some(one_time_key) = keys.their_one_time_key {
                ikm.extend_from_slice(&keys.our_ephemeral_secret.calculate_agreement(one_time_key)?);
            }
            (
                keys.our_identity_secret.public_key(),
                *keys.their_identity_key,
            )
        }
        Handshake::Responder(keys) => {
            ikm.extend_from_slice(
                &keys
                    .our_long_term_secret
                    .calculate_agreement(keys.their_identity_key)?,
            );
            ikm.extend_from_slice(
                &keys
                    .our_identity_secret
                    .calculate_agreement(keys.their_ephemeral_key)?,
            );
            ikm.extend_from_slice(
                &keys
                    .our_long_term_secret
                    .calculate_agreement(keys.their_ephemeral_key)?,
            );
            if let Some(one_time_secret) = keys.our_one_time_secret {
                ikm.extend_from_slice(&one_time_secret.calculate_agreement(keys.their_ephemeral_key)?);
            }
            (
                *keys.their_identity_key,
                keys.our_identity_secret.public_key(),
            )
        }
    };

    let info: Vec<u8> = [
        KDF_INFO,
        &initiator_identity.as_bytes()[..],
        &responder_identity.as_bytes()[..],
        additional_data,
    ]
    .concat();

    let okm: Zeroizing<[u8; OKM_SIZE]> = Zeroizing::new(hkdf(&[0u8; 32], &ikm, &info)?);

    let mut session_id = [0u8; SESSION_ID_SIZE];
    session_id.copy_from_slice(&okm[..SESSION_ID_SIZE]);

    let mut initiator_key = [0u8; CHANNEL_KEY_SIZE];
    initiator_key.copy_from_slice(&okm[SESSION_ID_SIZE..SESSION_ID_SIZE + CHANNEL_KEY_SIZE]);

    let mut responder_key = [0u8; CHANNEL_KEY_SIZE];
    responder_key.copy_from_slice(&okm[SESSION_ID_SIZE + CHANNEL_KEY_SIZE..]);

    Ok(HandshakeSecrets {
        session_id,
        initiator_key: Secret::from_bytes(initiator_key),
        responder_key: Secret::from_bytes(responder_key),
    })
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::{Handshake, InitiatorKeys, ResponderKeys, x3dh_derive};

    struct Parties {
        alice_identity: SecretKey,
        alice_ephemeral: SecretKey,
        bob_identity: SecretKey,
        bob_long_term: SecretKey,
        bob_one_time: SecretKey,
    }

    fn parties() -> Parties {
        let rng = Rng::from_seed([1; 32]);
        Parties {
            alice_identity: SecretKey::generate(&rng).unwrap(),
            alice_ephemeral: SecretKey::generate(&rng).unwrap(),
            bob_identity: SecretKey::generate(&rng).unwrap(),
            bob_long_term: SecretKey::generate(&rng).unwrap(),
            bob_one_time: SecretKey::generate(&rng).unwrap(),
        }
    }

    #[test]
    fn both_roles_agree() {
        let p = parties();
        let bob_one_time_key = p.bob_one_time.public_key();

        for with_one_time in [true, false] {
            let alice = x3dh_derive(
                &Handshake::Initiator(InitiatorKeys {
                    our_identity_secret: &p.alice_identity,
                    our_ephemeral_secret: &p.alice_ephemeral,
                    their_identity_key: &p.bob_identity.public_key(),
                    their_long_term_key: &p.bob_long_term.public_key(),
                    their_one_time_key: with_one_time.then_some(&bob_one_time_key),
                }),
                b"chat",
            )
            .unwrap();

            let bob = x3dh_derive(
                &Handshake::Responder(ResponderKeys {
                    our_identity_secret: &p.bob_identity,
                    our_long_term_secret: &p.bob_long_term,
                    our_one_time_secret: with_one_time.then_some(&p.bob_one_time),
                    their_identity_key: &p.alice_identity.public_key(),
                    their_ephemeral_key: &p.alice_ephemeral.public_key(),
                }),
                b"chat",
            )
            .unwrap();

            assert_eq!(alice.session_id, bob.session_id);
            assert!(alice.initiator_key == bob.initiator_key);
            assert!(alice.responder_key == bob.responder_key);
            assert!(alice.initiator_key != alice.responder_key);
        }
    }

    #[test]
    fn mismatching_inputs_diverge() {
        let p = parties();
        let bob_one_time_key = p.bob_one_time.public_key();

        let alice = x3dh_derive(
            &Handshake::Initiator(InitiatorKeys {
                our_identity_secret: &p.alice_identity,
                our_ephemeral_secret: &p.alice_ephemeral,
                their_identity_key: &p.bob_identity.public_key(),
                their_long_term_key: &p.bob_long_term.public_key(),
                their_one_time_key: Some(&bob_one_time_key),
            }),
            b"chat",
        )
        .unwrap();

        // Responder does not use the one-time secret.
        let bob = x3dh_derive(
            &Handshake::Responder(ResponderKeys {
                our_identity_secret: &p.bob_identity,
                our_long_term_secret: &p.bob_long_term,
                our_one_time_secret: None,
                their_identity_key: &p.alice_identity.public_key(),
                their_ephemeral_key: &p.alice_ephemeral.public_key(),
            }),
            b"chat",
        )
        .unwrap();
        assert_ne!(alice.session_id, bob.session_id);

        // Responder uses different additional data.
        let bob = x3dh_derive(
            &Handshake::Responder(ResponderKeys {
                our_identity_secret: &p.bob_identity,
                our_long_term_secret: &p.bob_long_term,
                our_one_time_secret: Some(&p.bob_one_time),
                their_identity_key: &p.alice_identity.public_key(),
                their_ephemeral_key: &p.alice_ephemeral.public_key(),
            }),
            b"other chat",
        )
        .unwrap();
        assert_ne!(alice.session_id, bob.session_id);
    }
}

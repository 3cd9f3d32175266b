// SPDX-License-Identifier: MIT OR Apache-2.0

//! Derived two-party session with one channel key per direction.
//!
//! Every message is encrypted with its own key and nonce, expanded from the channel key with a
//! fresh random salt. The salt travels next to the ciphertext, the session id is authenticated
//! as additional data.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x3dh::{CHANNEL_KEY_SIZE, Handshake, SESSION_ID_SIZE, X3dhError, x3dh_derive};
use crate::crypto::xchacha20::{
    XAEAD_KEY_SIZE, XAEAD_NONCE_SIZE, XAeadError, XAeadKey, XAeadNonce, x_aead_decrypt,
    x_aead_encrypt,
};
use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{deserialize_hex_array, serialize_hex};

pub const SALT_SIZE: usize = 32;

/// Random per-message salt.
pub type Salt = [u8; SALT_SIZE];

/// Identifier of a session, equal on both sides after a successful handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    [u8; SESSION_ID_SIZE],
);

impl SessionId {
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Channel keys of an established session. Never persisted, always re-derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    send_key: Secret<CHANNEL_KEY_SIZE>,
    receive_key: Secret<CHANNEL_KEY_SIZE>,
}

impl Session {
    /// Runs the handshake derivation and assigns the channel keys according to our role.
    pub fn derive(handshake: &Handshake<'_>, additional_data: &[u8]) -> Result<Self, SessionError> {
        let secrets = x3dh_derive(handshake, additional_data)?;
        let (send_key, receive_key) = match handshake {
            Handshake::Initiator(_) => (secrets.initiator_key, secrets.responder_key),
            Handshake::Responder(_) => (secrets.responder_key, secrets.initiator_key),
        };
        Ok(Self {
            id: SessionId(secrets.session_id),
            send_key,
            receive_key,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn encrypt(&self, plaintext: &[u8], rng: &Rng) -> Result<(Salt, Vec<u8>), SessionError> {
        let salt: Salt = rng.random_array()?;
        let (key, nonce) = message_key(&salt, &self.send_key)?;
        let ciphertext = x_aead_encrypt(&key, plaintext, &nonce, self.id.as_bytes())?;
        Ok((salt, ciphertext))
    }

    pub fn decrypt(&self, salt: &Salt, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let (key, nonce) = message_key(salt, &self.receive_key)?;
        let plaintext = x_aead_decrypt(&key, ciphertext, &nonce, self.id.as_bytes())?;
        Ok(plaintext)
    }
}

fn message_key(
    salt: &Salt,
    channel_key: &Secret<CHANNEL_KEY_SIZE>,
) -> Result<(XAeadKey, XAeadNonce), SessionError> {
    let okm: [u8; XAEAD_KEY_SIZE + XAEAD_NONCE_SIZE] = hkdf(salt, channel_key.as_bytes(), &[])?;

    let mut key = [0u8; XAEAD_KEY_SIZE];
    key.copy_from_slice(&okm[..XAEAD_KEY_SIZE]);

    let mut nonce = [0u8; XAEAD_NONCE_SIZE];
    nonce.copy_from_slice(&okm[XAEAD_KEY_SIZE..]);

    Ok((key, nonce))
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Derivation(#[from] X3dhError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    XAead(#[from] XAeadError),
}

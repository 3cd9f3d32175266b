// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signed pre-keys and the bundles peers publish to allow others to start sessions with them.
//!
//! A bundle carries exactly one long-term pre-key, rotated by its owner after a configured
//! lifetime, and at most one one-time pre-key which the directory hands out only once. Both are
//! signed by the owning identity key. Before a bundle is used for a handshake its signatures are
//! verified against the identity key of the peer we expect to talk to, not against any third
//! party.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::xeddsa::{XEdDSAError, XSignature, xeddsa_sign, xeddsa_verify};
use crate::crypto::Rng;
use crate::encoding::{deserialize_hex_array, serialize_hex};

/// Content-addressed identifier of a pre-key, derived from its public key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreKeyId(
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex_array"
    )]
    [u8; SHA256_DIGEST_SIZE],
);

impl PreKeyId {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(sha2_256(&[public_key.as_bytes()]))
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_DIGEST_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PreKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PreKeyId {
    type Err = hex::FromHexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; SHA256_DIGEST_SIZE];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Public pre-key signed by the identity owning it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    id: PreKeyId,
    key: PublicKey,
    signature: XSignature,
}

impl SignedPreKey {
    /// Signs the public counterpart of `secret` with our identity secret.
    pub fn sign(
        secret: &SecretKey,
        identity_secret: &SecretKey,
        rng: &Rng,
    ) -> Result<Self, XEdDSAError> {
        let key = secret.public_key();
        let signature = xeddsa_sign(key.as_bytes(), identity_secret, rng)?;
        Ok(Self {
            id: PreKeyId::from_public_key(&key),
            key,
            signature,
        })
    }

    pub fn from_parts(id: PreKeyId, key: PublicKey, signature: XSignature) -> Self {
        Self { id, key, signature }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn signature(&self) -> &XSignature {
        &self.signature
    }

    /// Checks that the pre-key was signed by `identity_key` and that its id matches the key.
    pub fn verify(&self, identity_key: &PublicKey) -> Result<(), KeyBundleError> {
        if self.id != PreKeyId::from_public_key(&self.key) {
            return Err(KeyBundleError::VerificationFailed(self.id));
        }

        xeddsa_verify(self.key.as_bytes(), identity_key, &self.signature)
            .map_err(|_| KeyBundleError::VerificationFailed(self.id))
    }
}

/// Pre-keys of a peer as fetched from the identity directory for a single new session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    long_term: SignedPreKey,
    one_time: Option<SignedPreKey>,
}

impl PreKeyBundle {
    pub fn new(long_term: SignedPreKey, one_time: Option<SignedPreKey>) -> Self {
        Self {
            long_term,
            one_time,
        }
    }

    pub fn long_term(&self) -> &SignedPreKey {
        &self.long_term
    }

    pub fn one_time(&self) -> Option<&SignedPreKey> {
        self.one_time.as_ref()
    }

    /// Verifies the long-term pre-key and, when present, the one-time pre-key.
    ///
    /// A missing one-time pre-key is not an error, the directory might have run out of them.
    pub fn verify(&self, identity_key: &PublicKey) -> Result<(), KeyBundleError> {
        self.long_term.verify(identity_key)?;
        if let Some(one_time) = &self.one_time {
            one_time.verify(identity_key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("signature of pre-key {0} does not match identity key")]
    VerificationFailed(PreKeyId),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::{KeyBundleError, PreKeyBundle, PreKeyId, SignedPreKey};

    #[test]
    fn verify() {
        let rng = Rng::from_seed([1; 32]);

        let identity_secret = SecretKey::generate(&rng).unwrap();
        let identity_key = identity_secret.public_key();

        let long_term_secret = SecretKey::generate(&rng).unwrap();
        let long_term = SignedPreKey::sign(&long_term_secret, &identity_secret, &rng).unwrap();

        let one_time_secret = SecretKey::generate(&rng).unwrap();
        let one_time = SignedPreKey::sign(&one_time_secret, &identity_secret, &rng).unwrap();

        // Valid bundles, with and without one-time pre-key.
        assert!(
            PreKeyBundle::new(long_term.clone(), Some(one_time.clone()))
                .verify(&identity_key)
                .is_ok()
        );
        assert!(
            PreKeyBundle::new(long_term.clone(), None)
                .verify(&identity_key)
                .is_ok()
        );

        // Signed by someone else.
        let other_secret = SecretKey::generate(&rng).unwrap();
        let forged = SignedPreKey::sign(&one_time_secret, &other_secret, &rng).unwrap();
        assert_matches!(
            PreKeyBundle::new(long_term.clone(), Some(forged)).verify(&identity_key),
            Err(KeyBundleError::VerificationFailed(id)) if id == one_time.id()
        );

        // Verified against the wrong identity.
        assert!(
            PreKeyBundle::new(long_term.clone(), None)
                .verify(&other_secret.public_key())
                .is_err()
        );

        // Key swapped while keeping the original signature.
        let swapped = SignedPreKey::from_parts(
            PreKeyId::from_public_key(one_time.key()),
            *one_time.key(),
            *long_term.signature(),
        );
        assert!(swapped.verify(&identity_key).is_err());

        // Id does not belong to key.
        let wrong_id =
            SignedPreKey::from_parts(one_time.id(), *long_term.key(), *long_term.signature());
        assert!(wrong_id.verify(&identity_key).is_err());
    }

    #[test]
    fn prekey_id_hex() {
        let rng = Rng::from_seed([1; 32]);
        let secret = SecretKey::generate(&rng).unwrap();
        let id = PreKeyId::from_public_key(&secret.public_key());

        let parsed: PreKeyId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-prekey-id".parse::<PreKeyId>().is_err());
    }
}

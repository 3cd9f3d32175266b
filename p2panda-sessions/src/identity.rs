// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-lived identities of chat participants.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::{PublicKey, SecretKey};

/// Opaque, stable identifier of an identity as handed out by the identity directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Public identity of a participant: identifier and identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    id: IdentityId,
    public_key: PublicKey,
}

impl Identity {
    pub fn new(id: IdentityId, public_key: PublicKey) -> Self {
        Self { id, public_key }
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// Our own identity, including the identity secret.
///
/// The identity secret signs pre-keys and ephemeral keys and takes part in every handshake. It is
/// never written into the key lifecycle storage.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    identity: Identity,
    secret: SecretKey,
}

impl LocalIdentity {
    pub fn new(id: IdentityId, secret: SecretKey) -> Self {
        let public_key = secret.public_key();
        Self {
            identity: Identity::new(id, public_key),
            secret,
        }
    }

    pub fn id(&self) -> &IdentityId {
        self.identity.id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Initiator and responder roles of a session.
//!
//! An initiator defers the handshake derivation until it encrypts its first message, a
//! responder derives while accepting the first message. Both roles can be recovered from their
//! persisted [`SessionRecord`](crate::session_storage::SessionRecord), in which case the
//! derivation runs again immediately and yields the same channel keys.
mod initiator;
mod responder;

use thiserror::Error;

use crate::crypto::Rng;
use crate::crypto::xeddsa::XEdDSAError;
use crate::identity::IdentityId;
use crate::key_storage::KeyStorageError;
use crate::message::WireMessage;
use crate::session::{Session, SessionError, SessionId};
use crate::session_storage::{Role, SessionStorageError};
use crate::time::Timestamp;
use crate::traits::SessionBlobStore;

pub(crate) use initiator::ephemeral_key_name;
pub use initiator::{EphemeralKey, InitiatorSession};
pub use responder::ResponderSession;

/// Whether the handshake derivation already ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized(Session),
}

impl SessionState {
    pub fn session(&self) -> Result<&Session, ProtocolError> {
        match self {
            SessionState::Uninitialized => Err(ProtocolError::NoSession),
            SessionState::Initialized(session) => Ok(session),
        }
    }
}

/// Creation and expiry time of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionLifetime {
    pub created: Timestamp,
    pub expires: Timestamp,
}

/// Session of either role, as handed out by the chat manager.
#[derive(Debug)]
pub enum SecureSession<B> {
    Initiator(InitiatorSession<B>),
    Responder(ResponderSession),
}

impl<B> SecureSession<B>
where
    B: SessionBlobStore,
{
    pub fn role(&self) -> Role {
        match self {
            SecureSession::Initiator(_) => Role::Initiator,
            SecureSession::Responder(_) => Role::Responder,
        }
    }

    /// Session id, `None` as long as an initiator did not send its first message.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state().session().ok().map(Session::id)
    }

    pub fn peer_id(&self) -> &IdentityId {
        match self {
            SecureSession::Initiator(session) => session.peer_id(),
            SecureSession::Responder(session) => session.peer_id(),
        }
    }

    pub fn additional_data(&self) -> &[u8] {
        match self {
            SecureSession::Initiator(session) => session.additional_data(),
            SecureSession::Responder(session) => session.additional_data(),
        }
    }

    pub fn expires(&self) -> Timestamp {
        match self {
            SecureSession::Initiator(session) => session.lifetime().expires,
            SecureSession::Responder(session) => session.lifetime().expires,
        }
    }

    pub fn state(&self) -> &SessionState {
        match self {
            SecureSession::Initiator(session) => session.state(),
            SecureSession::Responder(session) => session.state(),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8], rng: &Rng) -> Result<WireMessage, ProtocolError> {
        match self {
            SecureSession::Initiator(session) => session.encrypt(plaintext, rng),
            SecureSession::Responder(session) => Ok(session.encrypt(plaintext, rng)?.into()),
        }
    }

    pub fn decrypt(&self, message: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
        match (self, message) {
            (SecureSession::Initiator(session), WireMessage::Regular(message)) => {
                session.decrypt(message)
            }
            (SecureSession::Responder(session), WireMessage::Regular(message)) => {
                session.decrypt(message)
            }
            (SecureSession::Responder(session), WireMessage::Initiation(message)) => {
                session.decrypt_initiation(message)
            }
            (SecureSession::Initiator(_), WireMessage::Initiation(_)) => {
                Err(ProtocolError::UnexpectedInitiation)
            }
        }
    }

    pub fn encrypt_to_json(&mut self, plaintext: &[u8], rng: &Rng) -> Result<String, ProtocolError> {
        Ok(self.encrypt(plaintext, rng)?.to_json()?)
    }

    pub fn decrypt_json(&self, json: &str) -> Result<Vec<u8>, ProtocolError> {
        self.decrypt(&WireMessage::from_json(json)?)
    }
}

impl<B> From<InitiatorSession<B>> for SecureSession<B> {
    fn from(session: InitiatorSession<B>) -> Self {
        SecureSession::Initiator(session)
    }
}

impl<B> From<ResponderSession> for SecureSession<B> {
    fn from(session: ResponderSession) -> Self {
        SecureSession::Responder(session)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("session is not established yet")]
    NoSession,

    #[error("ephemeral key signature of {0} is invalid")]
    VerificationFailed(IdentityId),

    #[error("message claims to be sent by {received}, expected {expected}")]
    IdentityMismatch {
        expected: IdentityId,
        received: IdentityId,
    },

    #[error("message belongs to session {received}, expected {expected}")]
    SessionMismatch {
        expected: SessionId,
        received: SessionId,
    },

    #[error("initiation message does not belong to this session")]
    UnexpectedInitiation,

    #[error(transparent)]
    KeyStorage(#[from] KeyStorageError),

    #[error(transparent)]
    SessionStorage(#[from] SessionStorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

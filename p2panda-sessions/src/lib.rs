// SPDX-License-Identifier: MIT OR Apache-2.0

//! `p2panda-sessions` establishes end-to-end encrypted two-party chat sessions with forward
//! secrecy, based on signed pre-keys which peers publish in an identity directory.
//!
//! Every identity publishes a long-term pre-key, rotated after a configured lifetime, and a pool
//! of one-time pre-keys which the directory hands out only once. To start a session, the
//! initiator fetches a bundle of these pre-keys, verifies that they were signed by the peer's
//! identity key and runs an [X3DH](https://signal.org/docs/specifications/x3dh) handshake
//! derivation with a fresh ephemeral key. The first message carries the signed ephemeral key, so
//! the responder can derive the same session without both parties being online at the same
//! time. Compromising a long-term key later does not reveal the traffic of past sessions, since
//! ephemeral and one-time secrets are deleted once no session needs them anymore.
//!
//! ## State and recovery
//!
//! Derived channel keys are never written to disk. Instead each session is persisted as a small
//! record referring to the secret keys it was derived from, and re-derived after a restart. This
//! makes key deletion the one place where forward secrecy is decided: [`ChatManager::cleanup`]
//! drops expired sessions and then purges every secret key no remaining session refers to.
//!
//! ## Pluggable backends
//!
//! Secret keys, session records and the identity directory are accessed through the traits in
//! [`traits`], so applications can bring their own keychain, database and network service.
//! In-memory implementations for testing are available with the `test_utils` feature.
pub mod config;
pub mod crypto;
mod encoding;
pub mod identity;
pub mod key_bundle;
pub mod key_storage;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod session;
pub mod session_storage;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod time;
pub mod traits;

pub use config::ManagerConfig;
pub use crypto::{Rng, RngError};
pub use encoding::{DecodeError, EncodeError};
pub use identity::{Identity, IdentityId, LocalIdentity};
pub use key_bundle::{KeyBundleError, PreKeyBundle, PreKeyId, SignedPreKey};
pub use key_storage::{KeyIndex, KeyKind, KeyNaming, KeyStorage, KeyStorageError, PurgeSummary};
pub use manager::{ChatManager, ManagerError, PublishSummary};
pub use message::{InitiationMessage, RegularMessage, WireMessage};
pub use protocol::{InitiatorSession, ProtocolError, ResponderSession, SecureSession, SessionState};
pub use session::{Session, SessionError, SessionId};
pub use session_storage::{Role, SessionRecord, SessionStorage, SessionStorageError};
pub use time::{SystemClock, Timestamp};

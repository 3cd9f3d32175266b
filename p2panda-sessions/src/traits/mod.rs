// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the storage backends and the identity directory the chat manager depends on.
mod directory;
mod stores;

pub use crate::time::Clock;
pub use directory::IdentityDirectory;
pub use stores::{SecureKeyStore, SessionBlobStore};

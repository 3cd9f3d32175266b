// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementations of all external collaborators, for tests and examples.
mod clock;
mod directory;
mod stores;

pub use clock::ManualClock;
pub use directory::{MemoryDirectory, MemoryDirectoryError};
pub use stores::{MemoryBlobStore, MemoryKeyStore, MemoryStoreError};

/// Installs a tracing subscriber if `RUST_LOG` is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

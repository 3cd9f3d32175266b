// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY: Duration = Duration::from_secs(60 * 60 * 24);
const SESSION_TTL: Duration = Duration::from_secs(DAY.as_secs() * 5);
const LONG_TERM_KEY_TTL: Duration = Duration::from_secs(DAY.as_secs() * 7);
const EXPIRED_LONG_TERM_KEY_TTL: Duration = Duration::from_secs(DAY.as_secs() * 7);
const ONE_TIME_KEYS_TARGET: usize = 100;

/// Configuration parameters of a chat manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Lifetime of a session, counted from its creation.
    ///
    /// Default: 5 days.
    pub(crate) session_ttl: Duration,

    /// Rotate our long-term pre-key once it is older than this.
    ///
    /// Default: 7 days.
    pub(crate) long_term_key_ttl: Duration,

    /// Keep the secret of a rotated long-term pre-key around for this long after it stopped
    /// being fresh, peers might still use the old bundle they fetched earlier.
    ///
    /// Default: 7 days.
    pub(crate) expired_long_term_key_ttl: Duration,

    /// Number of unused one-time pre-keys we aim to have published.
    ///
    /// Default: 100.
    pub(crate) one_time_keys_target: usize,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn long_term_key_ttl(mut self, ttl: Duration) -> Self {
        self.long_term_key_ttl = ttl;
        self
    }

    pub fn expired_long_term_key_ttl(mut self, ttl: Duration) -> Self {
        self.expired_long_term_key_ttl = ttl;
        self
    }

    pub fn one_time_keys_target(mut self, target: usize) -> Self {
        self.one_time_keys_target = target;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_ttl: SESSION_TTL,
            long_term_key_ttl: LONG_TERM_KEY_TTL,
            expired_long_term_key_ttl: EXPIRED_LONG_TERM_KEY_TTL,
            one_time_keys_target: ONE_TIME_KEYS_TARGET,
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::error::Error;

use crate::identity::IdentityId;
use crate::key_bundle::{PreKeyBundle, PreKeyId, SignedPreKey};

/// Remote service where identities publish their pre-keys and fetch the ones of others.
///
/// Calls might go over the network, bounding them in time is up to the implementation.
pub trait IdentityDirectory {
    type Error: Error + Send + Sync + 'static;

    /// Returns the latest long-term pre-key of `id` together with one of its unused one-time
    /// pre-keys, if any are left. The returned one-time pre-key is marked as exhausted.
    fn fetch_prekey_bundle(&self, id: &IdentityId) -> Result<PreKeyBundle, Self::Error>;

    fn publish_long_term_key(
        &self,
        owner: &IdentityId,
        prekey: SignedPreKey,
    ) -> Result<(), Self::Error>;

    fn publish_one_time_keys(
        &self,
        owner: &IdentityId,
        prekeys: Vec<SignedPreKey>,
    ) -> Result<(), Self::Error>;

    /// Returns the subset of `owned` one-time pre-keys which were already handed out to someone.
    fn exhausted_one_time_keys(
        &self,
        owner: &IdentityId,
        owned: &BTreeSet<PreKeyId>,
    ) -> Result<BTreeSet<PreKeyId>, Self::Error>;
}

//! Directory trait definition.

use crate::protocol::{PeerIdentity, PeerKey};
use async_trait::async_trait;

/// The authoritative table of currently known peers.
///
/// The directory is an ordered sequence of [`PeerIdentity`] entries, keyed
/// by [`PeerIdentity::key`]. It is mutated only by its owning process (the
/// coordinator); everyone else sees read-only snapshots pushed over
/// coordinator links.
///
/// # Consistency
///
/// Every mutation produces a complete new snapshot. A replica is always
/// either the authoritative copy or a strictly older full snapshot; no
/// partial or merged state exists anywhere.
#[async_trait(?Send)]
pub trait Directory {
    /// Insert a peer, or replace its entry wholesale if the key is already
    /// present. Replacement keeps the entry's position; new peers append.
    async fn add_or_update(&self, identity: PeerIdentity);

    /// Remove a peer by key.
    ///
    /// Returns `true` if an entry was removed. Removing an absent key is a
    /// successful no-op.
    async fn remove(&self, key: &PeerKey) -> bool;

    /// The current ordered snapshot.
    async fn snapshot(&self) -> Vec<PeerIdentity>;
}

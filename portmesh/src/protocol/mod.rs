//! Wire vocabulary shared by every process in the mesh.
//!
//! This module defines the shapes that cross process boundaries: peer
//! identities, the control frames exchanged over coordinator links, and the
//! envelopes carried over brokered endpoints. No logic lives here beyond
//! construction helpers and target resolution; everything else in the crate
//! depends on these types.

pub mod envelope;
pub mod identity;
pub mod target;

pub use envelope::{ControlFrame, Envelope, InvokeFault};
pub use identity::{PeerIdentity, PeerKey, PeerRole};
pub use target::{Pattern, Target};

use serde::{Deserialize, Serialize};

/// A unit of traffic on any channel: either coordinator-link control
/// vocabulary or an endpoint-level envelope.
///
/// Control frames only ever travel over coordinator links; envelopes travel
/// over brokered endpoints and, for peers that have not brokered a port to
/// the coordinator, over the coordinator link as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Coordinator-link control traffic.
    Control(ControlFrame),
    /// Peer-level message or invoke traffic.
    Envelope(Envelope),
}

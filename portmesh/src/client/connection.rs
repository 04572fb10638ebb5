//! Per-peer connection state.
//!
//! A client's route to another peer is an explicit state machine rather
//! than an implicit "do I have an endpoint yet" check:
//!
//! ```text
//! (absent) ──first send──▶ Brokering ──PORT_MESSAGE──▶ Ready
//!                              │                         │
//!                              └──PORT_FAILURE /         └──endpoint closed /
//!                                 peer removed:             peer removed:
//!                                 queue rejected,           entry dropped,
//!                                 entry dropped             next send re-brokers
//! ```
//!
//! Exactly one `PORT_REQUEST` is issued, on the transition into
//! `Brokering`; sends arriving while brokering is in flight park in the
//! queue and flush in order when the endpoint lands.

use crate::error::MeshError;
use crate::protocol::Envelope;
use crate::transport::Endpoint;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// An envelope parked behind an in-flight brokering request, plus the
/// channel that releases (or rejects) the originating `send`.
pub(crate) struct QueuedSend {
    pub(crate) envelope: Envelope,
    pub(crate) done: oneshot::Sender<Result<(), MeshError>>,
}

/// State of the route to one remote peer.
pub(crate) enum PeerConnection {
    /// A `PORT_REQUEST` is in flight; envelopes wait here.
    Brokering { queue: Vec<QueuedSend> },

    /// A live brokered endpoint with its reader task.
    Ready {
        endpoint: Endpoint,
        reader: JoinHandle<()>,
    },
}

impl PeerConnection {
    /// Reject every queued send (no-op for `Ready`) and stop the reader
    /// task (no-op for `Brokering`). Called when the peer vanishes from the
    /// directory, brokering fails, or the client shuts down.
    pub(crate) fn tear_down(self, error: impl Fn() -> MeshError) {
        match self {
            PeerConnection::Brokering { queue } => {
                for queued in queue {
                    // Receiver may be gone if the sender gave up.
                    let _ = queued.done.send(Err(error()));
                }
            }
            PeerConnection::Ready { reader, .. } => {
                reader.abort();
            }
        }
    }
}

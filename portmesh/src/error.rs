//! Error types for the portmesh protocol.

use thiserror::Error;

/// Errors surfaced by mesh operations.
///
/// Nothing in this taxonomy is fatal to the process; the worst outcome of
/// any operation is a rejected future carrying one of these variants.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Operation attempted before the client reached `Registered`.
    #[error("client is not registered with the coordinator")]
    NotRegistered,

    /// No directory snapshot naming this peer arrived within the
    /// registration window.
    #[error("registration timed out")]
    RegistrationTimeout,

    /// Target resolution found no matching peer.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// The coordinator could not broker because a peer is missing.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// A broadcast or ambiguous target was passed to a one-to-one operation.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// No response arrived within the call's deadline.
    #[error("invoke timed out")]
    InvokeTimeout,

    /// The remote peer has no handler registered for the invoke channel.
    #[error("no handler registered for channel: {0}")]
    NoHandler(String),

    /// A remote invoke handler failed; wrapped and returned to the caller.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A local message listener failed.
    ///
    /// Reported on the client's error channel, never propagated to the
    /// dispatch of subsequent listeners.
    #[error("listener for '{message}' failed: {detail}")]
    Listener {
        /// The message name the listener was registered for.
        message: String,
        /// The listener's failure description.
        detail: String,
    },

    /// The owning client was shut down while the operation was pending.
    #[error("client shut down")]
    Shutdown,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by the in-process endpoint primitive.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The remote half of the endpoint was dropped.
    #[error("endpoint closed")]
    Closed,

    /// The read half was already handed to a reader task.
    #[error("endpoint receiver already taken")]
    ReceiverTaken,
}

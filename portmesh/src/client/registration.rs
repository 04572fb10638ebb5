//! Registration state machine for non-coordinator peers.

/// Lifecycle of a peer's announcement to the coordinator.
///
/// # State Transitions
///
/// ```text
/// Unregistered → Subscribing → Registered   (snapshot naming self arrived)
///                           └→ Failed       (timer fired first)
/// ```
///
/// `Registered` and `Failed` are terminal: a failed peer is retried only by
/// constructing a fresh client. While a client is in any state other than
/// `Registered`, `send` and `invoke` fail immediately with `NotRegistered`
/// rather than queuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Construction-time default; no registration request sent yet.
    Unregistered,

    /// Registration request sent; waiting for a directory snapshot that
    /// names this peer.
    Subscribing,

    /// A snapshot naming this peer arrived. Terminal.
    Registered,

    /// The registration window elapsed without such a snapshot. Terminal.
    Failed,
}

impl RegistrationState {
    /// Whether the state can no longer change for this instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Registered | RegistrationState::Failed)
    }
}

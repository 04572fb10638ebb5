//! Per-client construction options.

use std::time::Duration;

/// Configuration for a peer client instance.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Stable identifier announced during registration.
    ///
    /// Peers without an identifier are only addressable by handle and are
    /// excluded from pattern broadcast.
    pub identifier: Option<String>,

    /// How long to wait for a directory snapshot naming this peer before
    /// registration fails.
    pub registration_timeout: Duration,

    /// Default deadline for `invoke` calls without an explicit timeout.
    pub invoke_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            identifier: None,
            registration_timeout: Duration::from_secs(10),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    /// Set the identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the registration timeout.
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Set the default invoke timeout.
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }
}

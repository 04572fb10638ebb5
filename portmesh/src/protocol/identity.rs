//! Peer identity types.
//!
//! A peer is identified by its role plus either a stable string identifier
//! (chosen by the application) or the numeric handle assigned when its link
//! was created. Identities are immutable values: a directory update replaces
//! a peer's entry wholesale, it never patches one in place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a process plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// The single process that owns the directory and brokers endpoints.
    Coordinator,
    /// A windowed UI process.
    Window,
    /// A background compute process.
    Worker,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Coordinator => write!(f, "coordinator"),
            PeerRole::Window => write!(f, "window"),
            PeerRole::Worker => write!(f, "worker"),
        }
    }
}

/// A single entry in the peer directory.
///
/// # Uniqueness
///
/// `(role, identifier)` when an identifier is present, `(role, handle)`
/// otherwise; see [`PeerIdentity::key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// The peer's role.
    pub role: PeerRole,
    /// Optional stable application-chosen name (e.g. `"window:main"`).
    pub identifier: Option<String>,
    /// Numeric transport-assigned id, unique for the coordinator's lifetime.
    pub handle: u64,
    /// Optional free-form tag (e.g. an origin or URL).
    pub tag: Option<String>,
}

impl PeerIdentity {
    /// Create an identity with neither identifier nor tag.
    pub fn new(role: PeerRole, handle: u64) -> Self {
        Self {
            role,
            identifier: None,
            handle,
            tag: None,
        }
    }

    /// Attach a stable identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// The key this identity is unique under.
    pub fn key(&self) -> PeerKey {
        match &self.identifier {
            Some(identifier) => PeerKey::Named {
                role: self.role,
                identifier: identifier.clone(),
            },
            None => PeerKey::Numbered {
                role: self.role,
                handle: self.handle,
            },
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(identifier) => write!(f, "{}", identifier),
            None => write!(f, "{}/{}", self.role, self.handle),
        }
    }
}

/// Lookup key for a peer: its identifier when it has one, its handle
/// otherwise. Used to key endpoint caches and to name brokering targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerKey {
    /// Keyed by `(role, identifier)`.
    Named {
        /// The peer's role.
        role: PeerRole,
        /// The peer's stable identifier.
        identifier: String,
    },
    /// Keyed by `(role, handle)` for peers without an identifier.
    Numbered {
        /// The peer's role.
        role: PeerRole,
        /// The peer's numeric handle.
        handle: u64,
    },
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Named { role, identifier } => write!(f, "{}:{}", role, identifier),
            PeerKey::Numbered { role, handle } => write!(f, "{}/{}", role, handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefers_identifier() {
        let id = PeerIdentity::new(PeerRole::Window, 3).with_identifier("window:main");
        assert_eq!(
            id.key(),
            PeerKey::Named {
                role: PeerRole::Window,
                identifier: "window:main".to_string(),
            }
        );
    }

    #[test]
    fn test_key_falls_back_to_handle() {
        let id = PeerIdentity::new(PeerRole::Worker, 7);
        assert_eq!(
            id.key(),
            PeerKey::Numbered {
                role: PeerRole::Worker,
                handle: 7,
            }
        );
    }

    #[test]
    fn test_same_identifier_different_role_is_distinct() {
        let a = PeerIdentity::new(PeerRole::Window, 1).with_identifier("shared");
        let b = PeerIdentity::new(PeerRole::Worker, 2).with_identifier("shared");
        assert_ne!(a.key(), b.key());
    }
}

//! Send/invoke target addressing and resolution.
//!
//! A target names one peer (by identifier or handle) or a set of peers
//! (by identifier pattern). Resolution runs against the caller's cached
//! directory snapshot; peers without an identifier can only be addressed
//! by handle and are excluded from pattern broadcast.

use crate::protocol::PeerIdentity;
use regex::Regex;
use std::fmt;

/// Identifier pattern for broadcast targets.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches any identifier containing the given substring.
    Substring(String),
    /// Matches any identifier the regular expression matches.
    Regex(Regex),
}

impl Pattern {
    /// Whether the pattern matches the given identifier.
    pub fn matches(&self, identifier: &str) -> bool {
        match self {
            Pattern::Substring(needle) => identifier.contains(needle.as_str()),
            Pattern::Regex(regex) => regex.is_match(identifier),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Substring(needle) => write!(f, "*{}*", needle),
            Pattern::Regex(regex) => write!(f, "/{}/", regex),
        }
    }
}

/// Addressing for `send` and `invoke`.
#[derive(Debug, Clone)]
pub enum Target {
    /// One or more peers carrying this exact identifier.
    Identifier(String),
    /// The single peer with this numeric handle.
    Handle(u64),
    /// Every identifier-bearing peer whose identifier matches the pattern.
    AllIdentifiers(Pattern),
}

impl Target {
    /// Target a peer by identifier.
    pub fn identifier(identifier: impl Into<String>) -> Self {
        Target::Identifier(identifier.into())
    }

    /// Target every peer whose identifier contains the given substring.
    pub fn matching(needle: impl Into<String>) -> Self {
        Target::AllIdentifiers(Pattern::Substring(needle.into()))
    }

    /// Target every peer whose identifier matches the regular expression.
    pub fn matching_regex(regex: Regex) -> Self {
        Target::AllIdentifiers(Pattern::Regex(regex))
    }

    /// Whether this target is a pattern broadcast.
    ///
    /// Broadcast targets resolving to zero peers are a successful no-op for
    /// `send` and rejected outright by `invoke`.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::AllIdentifiers(_))
    }

    /// Resolve against a directory snapshot.
    ///
    /// Returns matching entries in directory order.
    pub fn resolve(&self, directory: &[PeerIdentity]) -> Vec<PeerIdentity> {
        match self {
            Target::Identifier(wanted) => directory
                .iter()
                .filter(|peer| peer.identifier.as_deref() == Some(wanted.as_str()))
                .cloned()
                .collect(),
            Target::Handle(wanted) => directory
                .iter()
                .filter(|peer| peer.handle == *wanted)
                .cloned()
                .collect(),
            Target::AllIdentifiers(pattern) => directory
                .iter()
                .filter(|peer| {
                    peer.identifier
                        .as_deref()
                        .is_some_and(|identifier| pattern.matches(identifier))
                })
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Identifier(identifier) => write!(f, "{}", identifier),
            Target::Handle(handle) => write!(f, "#{}", handle),
            Target::AllIdentifiers(pattern) => write!(f, "all({})", pattern),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerRole;

    fn directory() -> Vec<PeerIdentity> {
        vec![
            PeerIdentity::new(PeerRole::Window, 1).with_identifier("window:1"),
            PeerIdentity::new(PeerRole::Window, 2).with_identifier("window:2"),
            PeerIdentity::new(PeerRole::Worker, 3).with_identifier("compute-worker"),
            PeerIdentity::new(PeerRole::Worker, 4),
        ]
    }

    #[test]
    fn test_identifier_resolution() {
        let hits = Target::identifier("compute-worker").resolve(&directory());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].handle, 3);
    }

    #[test]
    fn test_handle_resolution() {
        let hits = Target::Handle(4).resolve(&directory());
        assert_eq!(hits.len(), 1);
        assert!(hits[0].identifier.is_none());
    }

    #[test]
    fn test_regex_broadcast_matches_prefix() {
        let target = Target::matching_regex(Regex::new("^window:").unwrap());
        let hits = target.resolve(&directory());
        let names: Vec<_> = hits.iter().filter_map(|p| p.identifier.clone()).collect();
        assert_eq!(names, vec!["window:1", "window:2"]);
    }

    #[test]
    fn test_substring_broadcast() {
        let hits = Target::matching("worker").resolve(&directory());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identifier.as_deref(), Some("compute-worker"));
    }

    #[test]
    fn test_broadcast_excludes_identifierless_peers() {
        // Handle 4 has no identifier: reachable by handle only.
        let hits = Target::matching("").resolve(&directory());
        assert!(hits.iter().all(|p| p.identifier.is_some()));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_unmatched_resolution_is_empty() {
        assert!(Target::identifier("nope").resolve(&directory()).is_empty());
        assert!(Target::Handle(99).resolve(&directory()).is_empty());
    }
}

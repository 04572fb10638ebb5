//! Shared in-memory directory implementation.

use crate::directory::Directory;
use crate::protocol::{PeerIdentity, PeerKey};
use async_trait::async_trait;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc;

/// Coordinator-owned directory backed by `Rc<RefCell>` state.
///
/// All mutation happens on the owning process's event loop, so no locking
/// is involved; the handle is cheap to clone and share across
/// coordinator-side components.
///
/// Each mutation fires the local "directory changed" notification to every
/// subscriber (see [`subscribe`](SharedDirectory::subscribe)). Pushing
/// `MAP_UPDATE` frames to peers is the coordinator's job. Directory
/// traffic always travels over coordinator links, never over brokered
/// endpoints, so peers that have brokered nothing still learn about
/// membership changes.
#[derive(Clone)]
pub struct SharedDirectory {
    state: Rc<RefCell<DirectoryState>>,
}

struct DirectoryState {
    /// Ordered entries; position is stable across in-place replacement.
    entries: Vec<PeerIdentity>,

    /// Local change subscribers, each receiving the full new snapshot.
    watchers: Vec<mpsc::UnboundedSender<Vec<PeerIdentity>>>,
}

impl SharedDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(DirectoryState {
                entries: Vec::new(),
                watchers: Vec::new(),
            })),
        }
    }

    /// Insert or wholesale-replace an entry. See [`Directory::add_or_update`].
    pub fn add_or_update_entry(&self, identity: PeerIdentity) {
        let key = identity.key();
        {
            let mut state = self.state.borrow_mut();
            match state.entries.iter().position(|entry| entry.key() == key) {
                Some(position) => state.entries[position] = identity.clone(),
                None => state.entries.push(identity.clone()),
            }
        }
        tracing::debug!(peer = %identity, "directory: entry added or updated");
        self.notify();
    }

    /// Remove an entry by key. See [`Directory::remove`].
    pub fn remove_entry(&self, key: &PeerKey) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            match state.entries.iter().position(|entry| &entry.key() == key) {
                Some(position) => {
                    state.entries.remove(position);
                    true
                }
                None => false,
            }
        };
        if removed {
            tracing::debug!(peer = %key, "directory: entry removed");
            self.notify();
        }
        removed
    }

    /// Clone of the current ordered snapshot.
    pub fn current(&self) -> Vec<PeerIdentity> {
        self.state.borrow().entries.clone()
    }

    /// Find an entry by key.
    pub fn find(&self, key: &PeerKey) -> Option<PeerIdentity> {
        self.state
            .borrow()
            .entries
            .iter()
            .find(|entry| &entry.key() == key)
            .cloned()
    }

    /// Subscribe to the local "directory changed" notification.
    ///
    /// Each mutation delivers the full new snapshot. Coordinator-side logic
    /// uses this to react to membership changes (e.g. to broker endpoints
    /// proactively).
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<PeerIdentity>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.borrow_mut().watchers.push(tx);
        rx
    }

    fn notify(&self) {
        let snapshot = self.current();
        self.state
            .borrow_mut()
            .watchers
            .retain(|watcher| watcher.send(snapshot.clone()).is_ok());
    }
}

impl Default for SharedDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Directory for SharedDirectory {
    async fn add_or_update(&self, identity: PeerIdentity) {
        self.add_or_update_entry(identity);
    }

    async fn remove(&self, key: &PeerKey) -> bool {
        self.remove_entry(key)
    }

    async fn snapshot(&self) -> Vec<PeerIdentity> {
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerRole;

    fn window(handle: u64, identifier: &str) -> PeerIdentity {
        PeerIdentity::new(PeerRole::Window, handle).with_identifier(identifier)
    }

    #[test]
    fn test_add_preserves_insertion_order() {
        let directory = SharedDirectory::new();
        directory.add_or_update_entry(window(1, "window:1"));
        directory.add_or_update_entry(window(2, "window:2"));

        let names: Vec<_> = directory
            .current()
            .iter()
            .filter_map(|p| p.identifier.clone())
            .collect();
        assert_eq!(names, vec!["window:1", "window:2"]);
    }

    #[test]
    fn test_update_replaces_wholesale_in_place() {
        let directory = SharedDirectory::new();
        directory.add_or_update_entry(window(1, "window:1"));
        directory.add_or_update_entry(window(2, "window:2"));

        // Same key, new tag: the entry is replaced, not patched, and keeps
        // its position.
        directory.add_or_update_entry(window(1, "window:1").with_tag("app://main"));

        let snapshot = directory.current();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].identifier.as_deref(), Some("window:1"));
        assert_eq!(snapshot[0].tag.as_deref(), Some("app://main"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let directory = SharedDirectory::new();
        directory.add_or_update_entry(window(1, "window:1"));
        let key = window(1, "window:1").key();

        assert!(directory.remove_entry(&key));
        assert!(!directory.remove_entry(&key));
        assert!(directory.current().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_every_mutation() {
        let directory = SharedDirectory::new();
        let mut changes = directory.subscribe();

        directory.add_or_update_entry(window(1, "window:1"));
        directory.add_or_update_entry(window(2, "window:2"));
        directory.remove_entry(&window(1, "window:1").key());

        assert_eq!(changes.recv().await.unwrap().len(), 1);
        assert_eq!(changes.recv().await.unwrap().len(), 2);
        let last = changes.recv().await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].identifier.as_deref(), Some("window:2"));
    }

    #[tokio::test]
    async fn test_trait_object_contract() {
        let directory = SharedDirectory::new();
        let as_trait: &dyn Directory = &directory;

        as_trait.add_or_update(window(1, "window:1")).await;
        assert_eq!(as_trait.snapshot().await.len(), 1);
        assert!(as_trait.remove(&window(1, "window:1").key()).await);
    }
}

//! Client-side notifications.

use crate::protocol::PeerIdentity;
use std::cell::RefCell;
use tokio::sync::mpsc;

/// Notifications a client emits as the mesh changes around it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A directory snapshot naming this peer arrived; the client is
    /// reachable by others from now on.
    RegistrationComplete,

    /// The registration window elapsed without such a snapshot.
    RegistrationFailed,

    /// A directory snapshot replaced the cached copy.
    DirectoryChanged,

    /// A brokered endpoint to the given peer was cached and is now live.
    EndpointAdded(PeerIdentity),
}

/// Fan-out of [`ClientEvent`]s to any number of subscribers.
///
/// Subscribers that drop their receiver are pruned on the next emit.
pub(crate) struct EventFan {
    senders: RefCell<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventFan {
    pub(crate) fn new() -> Self {
        Self {
            senders: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.borrow_mut().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        self.senders
            .borrow_mut()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let fan = EventFan::new();
        let mut first = fan.subscribe();
        let mut second = fan.subscribe();

        fan.emit(ClientEvent::DirectoryChanged);

        assert_eq!(first.recv().await.unwrap(), ClientEvent::DirectoryChanged);
        assert_eq!(second.recv().await.unwrap(), ClientEvent::DirectoryChanged);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let fan = EventFan::new();
        let first = fan.subscribe();
        let mut second = fan.subscribe();
        drop(first);

        fan.emit(ClientEvent::RegistrationComplete);
        assert_eq!(fan.senders.borrow().len(), 1);
        assert_eq!(
            second.recv().await.unwrap(),
            ClientEvent::RegistrationComplete
        );
    }
}

//! Bidirectional, transferable endpoint pairs.

use crate::error::TransportError;
use crate::protocol::Frame;
use std::cell::RefCell;
use std::fmt;
use tokio::sync::mpsc;

/// Type alias for an endpoint's read half, handed out by
/// [`Endpoint::take_receiver`].
pub type EndpointReceiver = mpsc::UnboundedReceiver<Packet>;

/// One delivery on an endpoint: a frame plus an optionally transferred
/// endpoint half (the in-process analogue of a postMessage transfer list).
pub struct Packet {
    /// The structured payload.
    pub frame: Frame,
    /// An endpoint half transferred alongside the frame.
    pub port: Option<Endpoint>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("frame", &self.frame)
            .field("port", &self.port.is_some())
            .finish()
    }
}

/// One half of a connected endpoint pair.
///
/// Writes go to the remote half; reads come from the local receiver, which
/// exactly one reader task claims via [`take_receiver`](Endpoint::take_receiver).
/// Dropping a half closes the pair: the remote's posts start failing with
/// [`TransportError::Closed`] and its receiver drains then yields `None`.
///
/// # Ordering
///
/// Frames posted on one half arrive at the other in posting order. Nothing
/// is guaranteed across distinct endpoint pairs.
pub struct Endpoint {
    tx: mpsc::UnboundedSender<Packet>,
    rx: RefCell<Option<EndpointReceiver>>,
}

impl Endpoint {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (Endpoint, Endpoint) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Endpoint {
                tx: tx_a,
                rx: RefCell::new(Some(rx_b)),
            },
            Endpoint {
                tx: tx_b,
                rx: RefCell::new(Some(rx_a)),
            },
        )
    }

    /// Post a frame to the remote half.
    pub fn post(&self, frame: Frame) -> Result<(), TransportError> {
        self.deliver(Packet { frame, port: None })
    }

    /// Post a frame and transfer an endpoint half alongside it.
    pub fn post_with_port(&self, frame: Frame, port: Endpoint) -> Result<(), TransportError> {
        self.deliver(Packet {
            frame,
            port: Some(port),
        })
    }

    /// Take ownership of the read half.
    ///
    /// Exactly one reader may claim it for the endpoint's lifetime.
    pub fn take_receiver(&self) -> Result<EndpointReceiver, TransportError> {
        self.rx
            .borrow_mut()
            .take()
            .ok_or(TransportError::ReceiverTaken)
    }

    /// Whether the remote half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A clonable write-only handle to the same remote half.
    ///
    /// Useful where a reply path must outlive a borrow of the endpoint
    /// itself.
    pub fn sender(&self) -> EndpointSender {
        EndpointSender {
            tx: self.tx.clone(),
        }
    }

    fn deliver(&self, packet: Packet) -> Result<(), TransportError> {
        self.tx.send(packet).map_err(|_| TransportError::Closed)
    }
}

/// Write-only handle to an endpoint's remote half.
#[derive(Clone)]
pub struct EndpointSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl EndpointSender {
    /// Post a frame to the remote half.
    pub fn post(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(Packet { frame, port: None })
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the remote half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for EndpointSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("closed", &self.is_closed())
            .field("receiver_taken", &self.rx.borrow().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlFrame, Envelope};
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = Endpoint::pair();
        a.post(Frame::Envelope(Envelope::message("first", vec![])))
            .unwrap();
        a.post(Frame::Envelope(Envelope::message("second", vec![json!(2)])))
            .unwrap();

        let mut rx = b.take_receiver().unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(
            matches!(first.frame, Frame::Envelope(Envelope::Message { message, .. }) if message == "first")
        );
        assert!(
            matches!(second.frame, Frame::Envelope(Envelope::Message { message, .. }) if message == "second")
        );
    }

    #[tokio::test]
    async fn test_transfer_carries_live_endpoint() {
        let (a, b) = Endpoint::pair();
        let (transferred, kept) = Endpoint::pair();

        a.post_with_port(
            Frame::Control(ControlFrame::Register { identifier: None }),
            transferred,
        )
        .unwrap();

        let mut rx = b.take_receiver().unwrap();
        let packet = rx.recv().await.unwrap();
        let received = packet.port.expect("port should be transferred");

        // The transferred half is still wired to its original peer.
        received
            .post(Frame::Envelope(Envelope::message("hello", vec![])))
            .unwrap();
        let mut kept_rx = kept.take_receiver().unwrap();
        assert!(kept_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_drop_closes_pair() {
        let (a, b) = Endpoint::pair();
        let mut rx = b.take_receiver().unwrap();
        drop(a);
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            b.post(Frame::Envelope(Envelope::message("late", vec![]))),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_receiver_single_claim() {
        let (a, _b) = Endpoint::pair();
        assert!(a.take_receiver().is_ok());
        assert!(matches!(
            a.take_receiver(),
            Err(TransportError::ReceiverTaken)
        ));
    }
}

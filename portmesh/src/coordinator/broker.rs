//! Endpoint brokering between registered peers.

use crate::coordinator::core::LinkTable;
use crate::directory::SharedDirectory;
use crate::error::MeshError;
use crate::protocol::{ControlFrame, Frame, PeerIdentity};
use crate::transport::Endpoint;

/// Creates fresh endpoint pairs and ships one half to each of two peers
/// over their coordinator links.
///
/// Each shipment is tagged with the *other* peer's identity so the
/// recipient can attribute the endpoint. The broker does not deduplicate:
/// brokering the same pair twice yields two independent endpoint pairs, so
/// callers (the peer client's connection state machine) must avoid
/// requesting a port they already hold.
pub struct EndpointBroker {
    directory: SharedDirectory,
    links: LinkTable,
}

impl EndpointBroker {
    pub(crate) fn new(directory: SharedDirectory, links: LinkTable) -> Self {
        Self { directory, links }
    }

    /// Broker one fresh endpoint pair between `a` and `b`.
    ///
    /// Preconditions: both peers are registered (present in the directory)
    /// and their links are attached. On `PeerNotFound` nothing has been
    /// sent to either peer.
    pub fn broker(&self, a: &PeerIdentity, b: &PeerIdentity) -> Result<(), MeshError> {
        for peer in [a, b] {
            if self.directory.find(&peer.key()).is_none() {
                return Err(MeshError::PeerNotFound(peer.key().to_string()));
            }
        }

        let links = self.links.borrow();
        let link_a = links
            .get(&a.handle)
            .ok_or_else(|| MeshError::PeerNotFound(a.key().to_string()))?;
        let link_b = links
            .get(&b.handle)
            .ok_or_else(|| MeshError::PeerNotFound(b.key().to_string()))?;

        // Both links resolved before anything is shipped.
        let (port_a, port_b) = Endpoint::pair();
        link_a.endpoint.post_with_port(
            Frame::Control(ControlFrame::PortMessage { sender: b.clone() }),
            port_a,
        )?;
        link_b.endpoint.post_with_port(
            Frame::Control(ControlFrame::PortMessage { sender: a.clone() }),
            port_b,
        )?;

        tracing::debug!(a = %a, b = %b, "endpoint pair brokered");
        Ok(())
    }
}

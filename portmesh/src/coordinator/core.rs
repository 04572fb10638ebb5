//! Coordinator runtime: link table, registration service, directory pushes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Coordinator                                               │
//! │                                                           │
//! │  SharedDirectory   ── authoritative peer table            │
//! │  links             ── handle → coordinator-side link half │
//! │  EndpointBroker    ── creates + distributes port pairs    │
//! │  PeerClient        ── the coordinator as an addressable   │
//! │                       peer (direct link, no handshake)    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The spawning subsystem drives membership: it calls
//! [`attach_peer`](Coordinator::attach_peer) when it creates a process
//! (shipping the returned seat to it) and
//! [`detach_peer`](Coordinator::detach_peer) when the process goes away.
//! Everything else (registration, directory pushes, port requests) is
//! serviced by per-link reader tasks.

use crate::client::{ClientOptions, PeerClient};
use crate::coordinator::broker::EndpointBroker;
use crate::directory::SharedDirectory;
use crate::error::MeshError;
use crate::protocol::{ControlFrame, Frame, PeerIdentity, PeerKey, PeerRole};
use crate::transport::{Endpoint, Packet};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything a spawned process needs to join the mesh: its handle, role,
/// tag, and its half of the coordinator link.
pub struct PeerSeat {
    /// Transport-assigned numeric id.
    pub handle: u64,
    /// The role the spawner created this process for.
    pub role: PeerRole,
    /// Optional origin/url tag recorded at attach time.
    pub tag: Option<String>,
    /// The peer's half of the coordinator link.
    pub link: Endpoint,
}

/// Coordinator-side state for one peer link.
pub(crate) struct PeerLink {
    /// Coordinator-side half of the link.
    pub(crate) endpoint: Endpoint,
    pub(crate) role: PeerRole,
    pub(crate) tag: Option<String>,
    /// Set once the peer's `REGISTER` arrives.
    pub(crate) identity: RefCell<Option<PeerIdentity>>,
    reader: RefCell<Option<JoinHandle<()>>>,
}

pub(crate) type LinkTable = Rc<RefCell<HashMap<u64, PeerLink>>>;

/// The coordinating process.
///
/// Owns the directory, the link table, and the endpoint broker, and acts
/// as an addressable peer through [`client`](Coordinator::client).
pub struct Coordinator {
    inner: Rc<CoordinatorInner>,
    client: PeerClient,
}

struct CoordinatorInner {
    directory: SharedDirectory,
    links: LinkTable,
    broker: EndpointBroker,
    next_handle: Cell<u64>,
    client: RefCell<Option<PeerClient>>,
}

impl Coordinator {
    /// Create a coordinator plus its own peer client.
    ///
    /// The coordinator's client is immediately `Registered`: its identity
    /// enters the directory here, before any peer can be attached.
    pub fn new(options: ClientOptions) -> Result<Self, MeshError> {
        let directory = SharedDirectory::new();
        let links: LinkTable = Rc::new(RefCell::new(HashMap::new()));
        let broker = EndpointBroker::new(directory.clone(), links.clone());
        let inner = Rc::new(CoordinatorInner {
            directory,
            links,
            broker,
            next_handle: Cell::new(0),
            client: RefCell::new(None),
        });

        let seat = inner.attach(PeerRole::Coordinator, None);
        let mut identity = PeerIdentity::new(PeerRole::Coordinator, seat.handle);
        identity.identifier = options.identifier.clone();

        let client = PeerClient::attached(seat.link, identity, options.clone())?;
        *inner.client.borrow_mut() = Some(client.clone());
        inner.register_peer(seat.handle, options.identifier);

        Ok(Self { inner, client })
    }

    /// The coordinator's own peer client.
    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// Attach a freshly spawned process.
    ///
    /// Allocates the next handle, wires up the coordinator-side link
    /// reader, and returns the seat the spawner hands to the new process.
    /// The peer enters the directory only once its `REGISTER` arrives.
    pub fn attach_peer(&self, role: PeerRole, tag: Option<String>) -> PeerSeat {
        self.inner.attach(role, tag)
    }

    /// Tear down a peer's link and remove it from the directory.
    ///
    /// Returns `true` if the handle was attached.
    pub fn detach_peer(&self, handle: u64) -> bool {
        self.inner.detach(handle)
    }

    /// Snapshot of the authoritative directory.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.inner.directory.current()
    }

    /// Subscribe to the local "directory changed" notification.
    pub fn subscribe_directory(&self) -> mpsc::UnboundedReceiver<Vec<PeerIdentity>> {
        self.inner.directory.subscribe()
    }

    /// Proactively broker an endpoint pair between two registered peers.
    pub fn broker(&self, a: &PeerKey, b: &PeerKey) -> Result<(), MeshError> {
        let a = self
            .inner
            .directory
            .find(a)
            .ok_or_else(|| MeshError::PeerNotFound(a.to_string()))?;
        let b = self
            .inner
            .directory
            .find(b)
            .ok_or_else(|| MeshError::PeerNotFound(b.to_string()))?;
        self.inner.broker.broker(&a, &b)
    }

    /// Detach every peer and shut the coordinator's client down.
    pub fn shutdown(&self) {
        let handles: Vec<u64> = self.inner.links.borrow().keys().copied().collect();
        for handle in handles {
            self.inner.detach(handle);
        }
        self.client.shutdown();
    }
}

impl CoordinatorInner {
    fn attach(self: &Rc<Self>, role: PeerRole, tag: Option<String>) -> PeerSeat {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);

        let (ours, theirs) = Endpoint::pair();
        self.links.borrow_mut().insert(
            handle,
            PeerLink {
                endpoint: ours,
                role,
                tag: tag.clone(),
                identity: RefCell::new(None),
                reader: RefCell::new(None),
            },
        );
        self.spawn_link_reader(handle);
        tracing::info!(handle, %role, "peer link attached");

        PeerSeat {
            handle,
            role,
            tag,
            link: theirs,
        }
    }

    fn detach(&self, handle: u64) -> bool {
        let Some(link) = self.links.borrow_mut().remove(&handle) else {
            return false;
        };
        if let Some(reader) = link.reader.borrow_mut().take() {
            reader.abort();
        }
        let identity = link.identity.borrow().clone();
        // Dropping the link closes the peer's half.
        drop(link);

        match identity {
            Some(identity) => {
                tracing::info!(peer = %identity, handle, "peer detached");
                if self.directory.remove_entry(&identity.key()) {
                    self.push_map();
                }
            }
            None => tracing::info!(handle, "unregistered peer link detached"),
        }
        true
    }

    fn spawn_link_reader(self: &Rc<Self>, handle: u64) {
        let rx = {
            let links = self.links.borrow();
            let Some(link) = links.get(&handle) else {
                return;
            };
            match link.endpoint.take_receiver() {
                Ok(rx) => rx,
                Err(error) => {
                    tracing::warn!(handle, %error, "link receiver unavailable");
                    return;
                }
            }
        };

        let weak = Rc::downgrade(self);
        let task = tokio::task::spawn_local(async move {
            let mut rx = rx;
            while let Some(packet) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_link_packet(handle, packet);
            }
            // The peer dropped its half: treat like destruction.
            if let Some(inner) = weak.upgrade() {
                tracing::info!(handle, "peer link closed");
                inner.detach(handle);
            }
        });
        if let Some(link) = self.links.borrow().get(&handle) {
            *link.reader.borrow_mut() = Some(task);
        }
    }

    fn handle_link_packet(self: &Rc<Self>, handle: u64, packet: Packet) {
        let Packet { frame, port } = packet;
        if port.is_some() {
            tracing::warn!(handle, "endpoint transfer towards the coordinator ignored");
        }
        match frame {
            Frame::Control(ControlFrame::Register { identifier }) => {
                self.register_peer(handle, identifier);
            }
            Frame::Control(ControlFrame::PortRequest { target }) => {
                self.service_port_request(handle, &target);
            }
            Frame::Control(frame) => {
                tracing::warn!(handle, ?frame, "unexpected control frame from peer");
            }
            Frame::Envelope(envelope) => {
                // Non-brokered traffic addressed to the coordinator itself.
                let sender = self
                    .links
                    .borrow()
                    .get(&handle)
                    .and_then(|link| link.identity.borrow().clone());
                let reply = self
                    .links
                    .borrow()
                    .get(&handle)
                    .map(|link| link.endpoint.sender());
                match (sender, reply, self.client.borrow().clone()) {
                    (Some(sender), Some(reply), Some(client)) => {
                        client.dispatch_relayed(sender, envelope, reply);
                    }
                    _ => tracing::warn!(handle, "envelope from unregistered peer dropped"),
                }
            }
        }
    }

    /// Service a `REGISTER`: enter the peer into the directory and push
    /// the new snapshot to every link.
    fn register_peer(&self, handle: u64, identifier: Option<String>) {
        let identity = {
            let links = self.links.borrow();
            let Some(link) = links.get(&handle) else {
                tracing::warn!(handle, "REGISTER from unknown link");
                return;
            };
            let mut identity = PeerIdentity::new(link.role, handle);
            identity.identifier = identifier;
            identity.tag = link.tag.clone();
            *link.identity.borrow_mut() = Some(identity.clone());
            identity
        };

        tracing::info!(peer = %identity, handle, "peer registered");
        self.directory.add_or_update_entry(identity);
        self.push_map();
    }

    fn service_port_request(&self, handle: u64, target: &PeerKey) {
        let requester = self
            .links
            .borrow()
            .get(&handle)
            .and_then(|link| link.identity.borrow().clone());
        let Some(requester) = requester else {
            self.port_failure(handle, target, "requester is not registered");
            return;
        };
        let Some(target_identity) = self.directory.find(target) else {
            self.port_failure(handle, target, "no such peer in the directory");
            return;
        };
        if let Err(error) = self.broker.broker(&requester, &target_identity) {
            self.port_failure(handle, target, &error.to_string());
        }
    }

    fn port_failure(&self, handle: u64, target: &PeerKey, error: &str) {
        tracing::warn!(handle, peer = %target, error, "port request failed");
        if let Some(link) = self.links.borrow().get(&handle) {
            let _ = link.endpoint.post(Frame::Control(ControlFrame::PortFailure {
                target: target.clone(),
                error: error.to_string(),
            }));
        }
    }

    /// Push the full directory snapshot to every attached link.
    ///
    /// Directory traffic always travels over coordinator links so peers
    /// that never brokered anything still learn about membership changes.
    fn push_map(&self) {
        let snapshot = self.directory.current();
        for (handle, link) in self.links.borrow().iter() {
            let update = ControlFrame::MapUpdate {
                map: snapshot.clone(),
            };
            if link.endpoint.post(Frame::Control(update)).is_err() {
                tracing::debug!(handle, "map push skipped, link closed");
            }
        }
    }
}

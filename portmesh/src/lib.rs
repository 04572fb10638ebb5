//! # Portmesh
//!
//! Typed, named messaging and request/response calls between the processes
//! of a multi-process application, with the coordinating process reduced to
//! *introduction*: it keeps the directory of who exists and hands out
//! private endpoint pairs; after that, peers talk directly.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     coordinator                             │
//! │   Coordinator runtime + EndpointBroker                      │
//! │   (attach/detach links, service REGISTER and PORT_REQUEST)  │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │  client                  │       directory                  │
//! │  • PeerClient            │       • Directory trait          │
//! │  • connection states     │       • SharedDirectory          │
//! │  • invoke correlation    │         (ordered, replicated     │
//! │  • registration machine  │          wholesale on change)    │
//! │  • ThrottledSender       │                                  │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                 protocol + transport                        │
//! │  PeerIdentity / Target / ControlFrame / Envelope            │
//! │  Endpoint pairs (transferable, FIFO per endpoint)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use portmesh::{ClientOptions, Coordinator, PeerClient, PeerRole, Target};
//!
//! // In the coordinating process:
//! let coordinator = Coordinator::new(ClientOptions::default().with_identifier("coordinator"))?;
//! let seat = coordinator.attach_peer(PeerRole::Window, Some("app://main".into()));
//! // ... ship `seat` to the spawned process ...
//!
//! // In the spawned process:
//! let client = PeerClient::connect(seat, ClientOptions::default().with_identifier("window:main"))?;
//! client.wait_registered().await?;
//! client.send(&Target::identifier("compute-worker"), "refresh", vec![]).await?;
//! ```
//!
//! ## Concurrency Model
//!
//! Each process runs a single cooperative event loop. All shared state is
//! `Rc<RefCell>`-owned and mutated only by its owning process; background
//! readers and timers are `spawn_local` tasks, so construct clients and
//! coordinators inside a `LocalSet` (or local runtime). Envelopes posted
//! on one endpoint arrive in posting order; nothing is ordered across
//! distinct endpoints.

#![deny(missing_docs)]

pub mod client;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{
    ClientEvent, ClientOptions, ListenerId, PeerClient, RegistrationState, ThrottledSender,
};
pub use coordinator::{Coordinator, EndpointBroker, PeerSeat};
pub use directory::{Directory, SharedDirectory};
pub use error::{MeshError, TransportError};
pub use protocol::{
    ControlFrame, Envelope, Frame, InvokeFault, Pattern, PeerIdentity, PeerKey, PeerRole, Target,
};
pub use transport::{Endpoint, EndpointSender, Packet};

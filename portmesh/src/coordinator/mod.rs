//! The coordinating process: directory ownership and endpoint brokering.
//!
//! The coordinator's job is *introduction*. It tells peers about each other
//! through full-directory pushes and hands out endpoint pairs on request;
//! once two peers hold a brokered endpoint, their traffic never revisits
//! the coordinator.

pub mod broker;
pub mod core;

pub use broker::EndpointBroker;
pub use self::core::{Coordinator, PeerSeat};

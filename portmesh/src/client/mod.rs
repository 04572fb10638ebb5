//! The peer client and its supporting machinery.
//!
//! One [`PeerClient`] lives in every process of the mesh. It holds the
//! cached directory, the per-peer endpoint cache with its explicit
//! brokering state machine, the listener and invoke-handler tables, and
//! the correlation map for outstanding calls.

pub mod config;
pub mod core;
pub mod events;
pub mod registration;
pub mod throttle;

mod connection;
mod invoke;

pub use config::ClientOptions;
pub use events::ClientEvent;
pub use self::core::{ListenerId, PeerClient};
pub use registration::RegistrationState;
pub use throttle::ThrottledSender;

//! In-process model of the host's transferable channel primitive.
//!
//! The spawning subsystem is expected to provide connected, transferable,
//! bidirectional endpoint pairs. This module supplies that primitive for
//! in-process use: unbounded channels carrying structured frames plus an
//! optional transferred endpoint half. Delivery order is FIFO per endpoint;
//! no ordering exists across endpoints.

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointReceiver, EndpointSender, Packet};

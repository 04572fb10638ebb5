//! The peer directory: who exists right now.
//!
//! Owned by the coordinator and replicated verbatim to every peer on each
//! membership change. Peers hold read-only cached copies; the snapshot is
//! always replaced wholesale, never merged.

pub mod shared;
pub mod traits;

pub use shared::SharedDirectory;
pub use traits::Directory;

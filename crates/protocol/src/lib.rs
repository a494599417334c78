//! Wire types for the cube task engine.
//!
//! This crate contains the serde-serializable shapes exchanged with the
//! outside world: task descriptors arriving on the event channel, messages
//! pushed back on it, draft records sent to the persistence backend, and the
//! line-delimited frames spoken with the browser automation daemon.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization and small accessors
//! * camelCase on the channel and backend, snake_case on the daemon socket
//! * Stable: Changes only when a wire format changes
//!
//! Orchestration logic lives in `cube-runtime`.

pub mod daemon;
pub mod descriptor;
pub mod draft;
pub mod image;
pub mod outbound;

pub use daemon::*;
pub use descriptor::*;
pub use draft::*;
pub use image::*;
pub use outbound::*;

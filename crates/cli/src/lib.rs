//! Process shell around `cube-runtime`.
//!
//! Connects the engine to the outside world: the reconnecting event channel
//! that carries task descriptors in and results out, the HTTP persistence
//! backend, and the automation daemon that owns the browser.

pub mod channel;
pub mod cli;
pub mod commands;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod router;
pub mod serve;

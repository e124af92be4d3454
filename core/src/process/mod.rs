//! Process primitives consumed by the supervisor
//!
//! Spawning, pipe plumbing and signal delivery live here so that the child
//! state machine only deals with already-opened pipe ends and a pid.
//!
//! ## Platform Support
//!
//! - **Unix**: `tokio::process` for spawn and reaping, `nix` for signals,
//!   optional `setsid()` placement for group-wide termination

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;

//! # Framelock Core
//!
//! Shared building blocks for the Framelock frame-lockstep protocol:
//! node identity and masks, the wire message format, tagged-section
//! frame-state framing, the engine state-capture seam, and the error
//! taxonomy used across every crate in the workspace.
//!
//! The protocol itself lives in `framelock-node`; the UDP transport in
//! `framelock-network`. This crate has no I/O.

pub mod capture;
pub mod config;
pub mod error;
pub mod frame_data;
pub mod types;
pub mod wire;

pub use error::{ClusterError, Result};
pub use types::{NodeId, NodeMask, NodeRole, MAX_NODE_COUNT};

//! # Framelock Node
//!
//! The emitter and repeater state machines of the Framelock lockstep
//! protocol, wrapped in a single [`ClusterNode`] the host engine drives
//! from its render loop.
//!
//! Lifecycle: handshake (repeaters announce themselves, the emitter
//! welcomes them), then the frame loop (the emitter broadcasts each
//! frame's state, repeaters restore it, render, and ack). A node that
//! observes an impossible frame number has diverged and parks itself in
//! a terminal fatal state.

pub mod emitter;
pub mod node;
pub mod registry;
pub mod repeater;

pub use emitter::EmitterNode;
pub use node::ClusterNode;
pub use registry::{RemoteNode, RemoteNodeRegistry};
pub use repeater::RepeaterNode;

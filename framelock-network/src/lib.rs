//! # Framelock Network
//!
//! UDP multicast transport for the Framelock protocol. The
//! [`agent::UdpAgent`] owns the socket and a receive thread; protocol
//! state machines in `framelock-node` drive it synchronously.

pub mod agent;
pub mod stats;

pub use agent::{ReceivedMessage, UdpAgent};
pub use stats::{TrafficSnapshot, TrafficStats};

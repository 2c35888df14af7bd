//! Public entry point: one [`ClusterNode`] per process, driven from the
//! host engine's render loop.
//!
//! The expected loop shape is:
//!
//! ```text
//! loop {
//!     node.do_frame();
//!     while !node.ready_to_proceed() && node.fatal_error().is_none() {
//!         node.do_frame();
//!     }
//!     render();
//!     node.conclude_frame();
//! }
//! ```
//!
//! `do_frame` never blocks for long; the host decides how to pace the
//! polling between frames.

use framelock_core::capture::StateCaptureBridge;
use framelock_core::config::{ClusterNodeConfig, UdpAgentConfig};
use framelock_core::{ClusterError, NodeId, Result};
use framelock_network::UdpAgent;
use std::sync::Arc;
use tracing::info;

use crate::emitter::EmitterNode;
use crate::repeater::RepeaterNode;

/// Everything a protocol state machine needs from its surroundings.
pub(crate) struct NodeCtx {
    pub(crate) config: ClusterNodeConfig,
    pub(crate) udp: Arc<UdpAgent>,
    pub(crate) bridge: Box<dyn StateCaptureBridge>,
    /// Set by [`ClusterNode::conclude_frame`], consumed by the state
    /// machines when they advance past the rendered frame.
    pub(crate) new_engine_frame: bool,
}

/// Terminal state after an unrecoverable failure. The node stays here;
/// recovery means restarting the process.
pub(crate) struct FatalState {
    error: ClusterError,
}

impl FatalState {
    pub(crate) fn new(error: ClusterError) -> Self {
        Self { error }
    }

    pub(crate) fn error(&self) -> &ClusterError {
        &self.error
    }
}

/// A node participating in a Framelock cluster, emitter or repeater.
pub enum ClusterNode {
    Emitter(EmitterNode),
    Repeater(RepeaterNode),
}

impl ClusterNode {
    /// Creates the node whose role matches `config.node_id` (id 0 is the
    /// emitter) and starts its handshake.
    pub fn new(
        config: ClusterNodeConfig,
        udp_config: UdpAgentConfig,
        bridge: Box<dyn StateCaptureBridge>,
    ) -> Result<Self> {
        let udp = Arc::new(UdpAgent::new(config.node_id, udp_config)?);
        info!(
            node = config.node_id.value(),
            emitter = config.is_emitter(),
            "cluster node starting"
        );
        let ctx = NodeCtx {
            config,
            udp,
            bridge,
            new_engine_frame: false,
        };
        if ctx.config.is_emitter() {
            Ok(ClusterNode::Emitter(EmitterNode::new(ctx)?))
        } else {
            Ok(ClusterNode::Repeater(RepeaterNode::new(ctx)?))
        }
    }

    /// Advances the protocol as far as it can without blocking.
    pub fn do_frame(&mut self) {
        match self {
            ClusterNode::Emitter(node) => node.do_frame(),
            ClusterNode::Repeater(node) => node.do_frame(),
        }
    }

    /// True when the host may render the current frame. Also true after
    /// a fatal error so the host loop never spins forever; check
    /// [`fatal_error`](Self::fatal_error) before rendering.
    pub fn ready_to_proceed(&self) -> bool {
        match self {
            ClusterNode::Emitter(node) => node.ready_to_proceed(),
            ClusterNode::Repeater(node) => node.ready_to_proceed(),
        }
    }

    /// Tells the protocol the host finished rendering the current frame.
    pub fn conclude_frame(&mut self) {
        match self {
            ClusterNode::Emitter(node) => node.conclude_frame(),
            ClusterNode::Repeater(node) => node.conclude_frame(),
        }
    }

    /// The frame the node is currently synchronizing. Zero until the
    /// handshake completes.
    pub fn current_frame_id(&self) -> u64 {
        match self {
            ClusterNode::Emitter(node) => node.current_frame_id(),
            ClusterNode::Repeater(node) => node.current_frame_id(),
        }
    }

    /// The unrecoverable error that stopped this node, if any.
    pub fn fatal_error(&self) -> Option<&ClusterError> {
        match self {
            ClusterNode::Emitter(node) => node.fatal_error(),
            ClusterNode::Repeater(node) => node.fatal_error(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            ClusterNode::Emitter(node) => node.ctx().config.node_id,
            ClusterNode::Repeater(node) => node.ctx().config.node_id,
        }
    }

    /// Transport-level access, mainly for diagnostics.
    pub fn udp(&self) -> &UdpAgent {
        match self {
            ClusterNode::Emitter(node) => &node.ctx().udp,
            ClusterNode::Repeater(node) => &node.ctx().udp,
        }
    }

    /// One-line human-readable status for overlays and logs.
    pub fn debug_status(&self) -> String {
        match self {
            ClusterNode::Emitter(node) => node.debug_status(),
            ClusterNode::Repeater(node) => node.debug_status(),
        }
    }
}

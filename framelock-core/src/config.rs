//! Node and transport configuration.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// How frame starts are gated across the cluster.
///
/// Only [`FenceMode::Network`] is driven by this protocol; the other modes
/// exist for deployments where an external swap barrier paces the nodes and
/// the network layer only distributes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FenceMode {
    #[default]
    Network,
    Hardware,
    External,
}

/// Configuration for one cluster node, emitter or repeater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    /// This node's identity. Id 0 is conventionally the emitter.
    pub node_id: NodeId,
    /// Number of repeaters the emitter waits for during handshake.
    /// Ignored on repeaters.
    pub expected_repeater_count: usize,
    /// How long the emitter waits for repeaters to register before
    /// starting with whoever showed up.
    pub handshake_timeout: Duration,
    /// Steady-state timeout: a repeater that misses this deadline for a
    /// FrameDone ack is evicted; a repeater that waits this long for a
    /// frame start gives up.
    pub communication_timeout: Duration,
    /// Repeaters render one frame behind the emitter.
    pub repeaters_delayed: bool,
    /// Frame pacing mechanism.
    pub fence: FenceMode,
    /// Upper bound on one frame's encoded state blob.
    pub max_frame_data_size: usize,
}

impl Default for ClusterNodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::EMITTER,
            expected_repeater_count: 0,
            handshake_timeout: Duration::from_secs(15),
            communication_timeout: Duration::from_secs(5),
            repeaters_delayed: false,
            fence: FenceMode::Network,
            max_frame_data_size: 16 * 1024,
        }
    }
}

impl ClusterNodeConfig {
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_expected_repeater_count(mut self, count: usize) -> Self {
        self.expected_repeater_count = count;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_communication_timeout(mut self, timeout: Duration) -> Self {
        self.communication_timeout = timeout;
        self
    }

    pub fn with_repeaters_delayed(mut self, delayed: bool) -> Self {
        self.repeaters_delayed = delayed;
        self
    }

    pub fn with_fence(mut self, fence: FenceMode) -> Self {
        self.fence = fence;
        self
    }

    pub fn with_max_frame_data_size(mut self, size: usize) -> Self {
        self.max_frame_data_size = size;
        self
    }

    /// True when this node's id marks it as the emitter.
    pub fn is_emitter(&self) -> bool {
        self.node_id == NodeId::EMITTER
    }
}

/// Configuration for the UDP multicast transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpAgentConfig {
    /// Multicast group every node joins for broadcast traffic.
    pub multicast_addr: Ipv4Addr,
    /// UDP port shared by the whole cluster.
    pub port: u16,
    /// Local interface to bind; `None` binds all interfaces.
    pub adapter: Option<Ipv4Addr>,
    /// Largest datagram the agent will send or accept.
    pub max_datagram_size: usize,
}

impl Default for UdpAgentConfig {
    fn default() -> Self {
        Self {
            multicast_addr: Ipv4Addr::new(224, 0, 1, 199),
            port: 25_690,
            adapter: None,
            max_datagram_size: 64 * 1024,
        }
    }
}

impl UdpAgentConfig {
    pub fn with_multicast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.multicast_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_adapter(mut self, adapter: Ipv4Addr) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClusterNodeConfig::default();
        assert!(config.is_emitter());
        assert_eq!(config.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.communication_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_data_size, 16 * 1024);
        assert_eq!(config.fence, FenceMode::Network);
    }

    #[test]
    fn builders_chain() {
        let node = NodeId::new(3).unwrap();
        let config = ClusterNodeConfig::default()
            .with_node_id(node)
            .with_expected_repeater_count(4)
            .with_communication_timeout(Duration::from_millis(250))
            .with_repeaters_delayed(true);
        assert!(!config.is_emitter());
        assert_eq!(config.expected_repeater_count, 4);
        assert_eq!(config.communication_timeout, Duration::from_millis(250));
        assert!(config.repeaters_delayed);
    }

    #[test]
    fn udp_config_round_trips_through_serde() {
        let config = UdpAgentConfig::default().with_port(41_000);
        let json = serde_json::to_string(&config).unwrap();
        let back: UdpAgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 41_000);
        assert_eq!(back.multicast_addr, config.multicast_addr);
    }
}

//! UDP multicast agent.
//!
//! One [`UdpAgent`] per node. Every datagram goes to the shared
//! multicast group; the destination mask in the header addresses it, and
//! each receiver drops what is not for it. A background thread drains
//! the socket into a channel so protocol code stays single-threaded and
//! tick-driven.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use framelock_core::config::UdpAgentConfig;
use framelock_core::wire::{MessageFlags, MessageHeader};
use framelock_core::{ClusterError, NodeId, NodeMask, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::stats::TrafficStats;

/// How long the rx thread blocks in `recv_from` before re-checking the
/// shutdown flag.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A datagram accepted for this node, header already validated.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
    pub sender: SocketAddr,
}

struct AgentShared {
    local_id: NodeId,
    config: UdpAgentConfig,
    socket: UdpSocket,
    multicast_target: SocketAddrV4,
    /// Known cluster members, this node included.
    all_nodes: AtomicU64,
    /// Nodes seen since the last [`UdpAgent::take_new_nodes`] call.
    new_nodes: AtomicU64,
    sequence: AtomicU64,
    stats: TrafficStats,
    shutdown: AtomicBool,
}

impl AgentShared {
    fn note_node(&self, origin: NodeId) {
        let bit = origin.mask().bits();
        let previous = self.all_nodes.fetch_or(bit, Ordering::AcqRel);
        if previous & bit == 0 {
            self.new_nodes.fetch_or(bit, Ordering::AcqRel);
            debug!(node = origin.value(), "discovered cluster node");
        }
    }
}

/// UDP transport endpoint for one cluster node.
///
/// Sending never blocks on peers and send failures are logged rather than
/// propagated; the protocol layer recovers through its own timeouts.
/// There is no unicast path: with every node bound to the shared port,
/// mask-addressed multicast is the only delivery that works for several
/// nodes on one host.
pub struct UdpAgent {
    shared: Arc<AgentShared>,
    rx: Receiver<ReceivedMessage>,
    rx_thread: Option<JoinHandle<()>>,
}

impl UdpAgent {
    /// Binds the shared cluster port, joins the multicast group, and
    /// starts the receive thread.
    pub fn new(local_id: NodeId, config: UdpAgentConfig) -> Result<Self> {
        let interface = config.adapter.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
        socket.join_multicast_v4(&config.multicast_addr, &interface)?;
        socket.set_multicast_loop_v4(true)?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RX_POLL_INTERVAL))?;

        let multicast_target = SocketAddrV4::new(config.multicast_addr, config.port);
        let shared = Arc::new(AgentShared {
            local_id,
            socket,
            multicast_target,
            all_nodes: AtomicU64::new(local_id.mask().bits()),
            new_nodes: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            stats: TrafficStats::default(),
            shutdown: AtomicBool::new(false),
            config,
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let rx_thread = std::thread::Builder::new()
            .name(format!("framelock-rx-{}", local_id.value()))
            .spawn({
                let shared = Arc::clone(&shared);
                move || rx_loop(shared, tx)
            })
            .map_err(|e| ClusterError::network(format!("failed to spawn rx thread: {e}")))?;

        Ok(Self {
            shared,
            rx,
            rx_thread: Some(rx_thread),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.shared.local_id
    }

    pub fn local_node_mask(&self) -> NodeMask {
        self.shared.local_id.mask()
    }

    /// Every node this agent has seen (itself included).
    pub fn all_nodes_mask(&self) -> NodeMask {
        NodeMask::from_bits(self.shared.all_nodes.load(Ordering::Acquire))
    }

    /// Returns and clears the set of nodes discovered since the last call.
    pub fn take_new_nodes(&self) -> NodeMask {
        NodeMask::from_bits(self.shared.new_nodes.swap(0, Ordering::AcqRel))
    }

    /// Marks a node as a known cluster member without waiting to hear
    /// from it.
    pub fn register_node(&self, node: NodeId) {
        self.shared.note_node(node);
    }

    /// Forgets a node: mask bit and pending discovery notification.
    pub fn clear_node(&self, node: NodeId) {
        let bit = node.mask().bits();
        self.shared.all_nodes.fetch_and(!bit, Ordering::AcqRel);
        self.shared.new_nodes.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Stamps origin, sequence and payload geometry onto `header` and
    /// sends it to the multicast group; the destination mask selects the
    /// nodes that will process it.
    pub fn publish(&self, mut header: MessageHeader, payload: &[u8]) -> Result<()> {
        if payload.len() > u16::MAX as usize
            || MessageHeader::SIZE + payload.len() > self.shared.config.max_datagram_size
        {
            return Err(ClusterError::network(format!(
                "payload of {} bytes exceeds the maximum datagram size",
                payload.len()
            )));
        }
        if !header.flags.contains(MessageFlags::BROADCAST) && header.destination_mask.is_empty() {
            return Err(ClusterError::network(
                "non-broadcast message with an empty destination mask",
            ));
        }

        header.origin_id = self.shared.local_id;
        header.sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        header.payload_size = payload.len() as u16;
        header.offset_to_payload = MessageHeader::SIZE as u16;

        let mut datagram = BytesMut::with_capacity(MessageHeader::SIZE + payload.len());
        header.write_to(&mut datagram);
        datagram.extend_from_slice(payload);

        self.send_to(&datagram, self.shared.multicast_target.into(), header);
        Ok(())
    }

    fn send_to(&self, datagram: &[u8], addr: SocketAddr, header: MessageHeader) {
        match self.shared.socket.send_to(datagram, addr) {
            Ok(_) => {
                self.shared.stats.record_sent(header.kind);
                trace!(kind = %header.kind, seq = header.sequence, %addr, "sent");
            }
            Err(error) => {
                warn!(kind = %header.kind, %addr, %error, "udp send failed");
            }
        }
    }

    /// Next accepted message, if one is already queued.
    pub fn try_next_rx(&self) -> Option<ReceivedMessage> {
        self.rx.try_recv().ok()
    }

    /// Next accepted message, waiting up to `timeout`.
    pub fn next_rx(&self, timeout: Duration) -> Option<ReceivedMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.shared.stats
    }
}

impl Drop for UdpAgent {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
    }
}

fn rx_loop(shared: Arc<AgentShared>, tx: Sender<ReceivedMessage>) {
    let mut buf = vec![0u8; shared.config.max_datagram_size];
    let local_mask = shared.local_id.mask();

    while !shared.shutdown.load(Ordering::Acquire) {
        let (len, sender) = match shared.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(error) => {
                warn!(%error, "udp receive failed");
                continue;
            }
        };

        let header = match MessageHeader::read_from(&buf[..len]) {
            Ok(header) => header,
            Err(error) => {
                warn!(%sender, %error, "discarding malformed datagram");
                continue;
            }
        };

        // Multicast loops our own datagrams back.
        if header.origin_id == shared.local_id {
            continue;
        }
        shared.note_node(header.origin_id);
        if !header.destination_mask.intersects(local_mask) {
            continue;
        }

        let start = header.offset_to_payload as usize;
        let end = start + header.payload_size as usize;
        if end > len {
            warn!(%sender, kind = %header.kind, "datagram shorter than its declared payload");
            continue;
        }

        shared.stats.record_received(header.kind);
        let message = ReceivedMessage {
            header,
            payload: Bytes::copy_from_slice(&buf[start..end]),
            sender,
        };
        if tx.send(message).is_err() {
            break; // agent dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelock_core::config::UdpAgentConfig;
    use framelock_core::wire::{FrameDone, MessageKind, RolePublication};
    use framelock_core::NodeRole;
    use std::sync::atomic::AtomicU16;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn test_config() -> UdpAgentConfig {
        init_tracing();
        let offset = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let lane = (std::process::id() % 128) as u16;
        UdpAgentConfig::default()
            .with_multicast_addr(Ipv4Addr::new(224, 0, 2, 100 + (offset % 100) as u8))
            .with_port(28_000 + lane * 100 + offset)
    }

    fn node(id: u8) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn broadcast_reaches_other_agent_but_not_sender() {
        let config = test_config();
        let emitter = UdpAgent::new(NodeId::EMITTER, config.clone()).unwrap();
        let repeater = UdpAgent::new(node(1), config).unwrap();

        let mut payload = BytesMut::new();
        RolePublication {
            role: NodeRole::Repeater,
        }
        .write_to(&mut payload);
        let header = MessageHeader::new(
            MessageKind::HelloEmitter,
            NodeMask::ALL,
            MessageFlags::BROADCAST,
        );
        repeater.publish(header, &payload).unwrap();

        let received = emitter
            .next_rx(Duration::from_secs(5))
            .expect("emitter should receive the hello");
        assert_eq!(received.header.kind, MessageKind::HelloEmitter);
        assert_eq!(received.header.origin_id, node(1));
        let publication = RolePublication::read_from(&received.payload).unwrap();
        assert_eq!(publication.role, NodeRole::Repeater);

        // The sender filters its own looped-back datagrams.
        assert!(repeater.try_next_rx().is_none());
    }

    #[test]
    fn received_datagram_marks_sender_as_known() {
        let config = test_config();
        let emitter = UdpAgent::new(NodeId::EMITTER, config.clone()).unwrap();
        let repeater = UdpAgent::new(node(2), config).unwrap();

        let header = MessageHeader::new(
            MessageKind::HelloEmitter,
            NodeMask::ALL,
            MessageFlags::BROADCAST,
        );
        repeater.publish(header, &[]).unwrap();
        emitter.next_rx(Duration::from_secs(5)).unwrap();

        assert!(emitter.all_nodes_mask().contains(node(2)));
        assert!(emitter.take_new_nodes().contains(node(2)));
        // Second take is empty: notifications are one-shot.
        assert!(emitter.take_new_nodes().is_empty());

        // A mask-addressed reply reaches exactly the node in the mask.
        let mut payload = BytesMut::new();
        FrameDone { frame_number: 0 }.write_to(&mut payload);
        let reply = MessageHeader::new(MessageKind::FrameDone, node(2).mask(), MessageFlags::NONE);
        emitter.publish(reply, &payload).unwrap();

        let received = repeater
            .next_rx(Duration::from_secs(5))
            .expect("repeater should receive the reply");
        assert_eq!(received.header.kind, MessageKind::FrameDone);
        assert_eq!(received.header.origin_id, NodeId::EMITTER);
    }

    #[test]
    fn messages_for_other_nodes_are_filtered() {
        let config = test_config();
        let emitter = UdpAgent::new(NodeId::EMITTER, config.clone()).unwrap();
        let bystander = UdpAgent::new(node(3), config).unwrap();

        // Addressed only to node 5; node 3 must not see it even though it
        // arrives on the shared multicast group.
        let header = MessageHeader::new(
            MessageKind::StartFrame,
            node(5).mask(),
            MessageFlags::BROADCAST,
        );
        emitter.publish(header, &[]).unwrap();

        assert!(bystander.next_rx(Duration::from_millis(600)).is_none());
        // It still learned that the emitter exists.
        assert!(bystander.all_nodes_mask().contains(NodeId::EMITTER));
    }

    #[test]
    fn empty_destination_without_broadcast_is_rejected() {
        let agent = UdpAgent::new(NodeId::EMITTER, test_config()).unwrap();

        let header = MessageHeader::new(MessageKind::FrameDone, NodeMask::EMPTY, MessageFlags::NONE);
        assert!(agent.publish(header, &[]).is_err());

        let header = MessageHeader::new(
            MessageKind::HelloEmitter,
            NodeMask::EMPTY,
            MessageFlags::BROADCAST,
        );
        assert!(agent.publish(header, &[]).is_ok());
    }

    #[test]
    fn clear_node_forgets_membership() {
        let agent = UdpAgent::new(NodeId::EMITTER, test_config()).unwrap();
        agent.register_node(node(4));
        assert!(agent.all_nodes_mask().contains(node(4)));

        agent.clear_node(node(4));
        assert!(!agent.all_nodes_mask().contains(node(4)));
        assert!(agent.take_new_nodes().is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let config = test_config().with_max_datagram_size(256);
        let agent = UdpAgent::new(NodeId::EMITTER, config).unwrap();
        let header = MessageHeader::new(
            MessageKind::StartFrame,
            NodeMask::ALL,
            MessageFlags::BROADCAST,
        );
        assert!(agent.publish(header, &[0u8; 512]).is_err());
    }
}

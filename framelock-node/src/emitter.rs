//! Emitter side of the lockstep protocol.
//!
//! The emitter handshakes with repeaters, then drives the frame loop:
//! capture engine state, broadcast the frame start, render, wait for
//! every repeater's ack, advance. Unresponsive repeaters are evicted so
//! one dead node cannot freeze the cluster.

use bytes::BytesMut;
use crossbeam_channel::{Receiver, TryRecvError};
use framelock_core::capture::gather_frame_state;
use framelock_core::config::FenceMode;
use framelock_core::wire::{AdvanceFrame, FrameDone, MessageFlags, MessageHeader, MessageKind, RolePublication};
use framelock_core::{ClusterError, NodeMask, NodeRole, Result};
use framelock_network::UdpAgent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::node::{FatalState, NodeCtx};
use crate::registry::{RemoteNode, RemoteNodeRegistry};

pub(crate) enum EmitterState {
    WaitingForAllClients(ClientDiscovery),
    SynchronizeFrame(FrameSynchronization),
    Fatal(FatalState),
}

enum DiscoveryOutcome {
    Ready(RemoteNodeRegistry),
    Failed(ClusterError),
}

/// Handshake stage: collects repeater hellos on a background thread and
/// welcomes each one, until the expected count registers or the
/// handshake timeout passes.
pub(crate) struct ClientDiscovery {
    outcome: Receiver<DiscoveryOutcome>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ClientDiscovery {
    pub(crate) fn spawn(
        udp: Arc<UdpAgent>,
        expected: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, outcome) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("framelock-handshake".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || discovery_loop(udp, expected, timeout, stop, tx)
            })
            .map_err(|e| ClusterError::internal(format!("failed to spawn handshake thread: {e}")))?;
        Ok(Self {
            outcome,
            stop,
            thread: Some(thread),
        })
    }

    /// `Ok(Some(registry))` once the handshake concluded.
    fn poll(&mut self) -> Result<Option<RemoteNodeRegistry>> {
        match self.outcome.try_recv() {
            Ok(DiscoveryOutcome::Ready(registry)) => Ok(Some(registry)),
            Ok(DiscoveryOutcome::Failed(error)) => Err(error),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(ClusterError::internal("handshake thread exited unexpectedly"))
            }
        }
    }
}

impl Drop for ClientDiscovery {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn discovery_loop(
    udp: Arc<UdpAgent>,
    expected: usize,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    tx: crossbeam_channel::Sender<DiscoveryOutcome>,
) {
    let deadline = Instant::now() + timeout;
    let mut registry = RemoteNodeRegistry::new();

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        if let Some(message) = udp.next_rx(Duration::from_millis(200)) {
            if message.header.kind == MessageKind::HelloEmitter {
                match RolePublication::read_from(&message.payload) {
                    Some(publication) if publication.role == NodeRole::Repeater => {
                        let node = RemoteNode {
                            id: message.header.origin_id,
                            role: publication.role,
                            endpoint: message.sender,
                        };
                        if registry.register(node) {
                            info!(
                                node = node.id.value(),
                                endpoint = %node.endpoint,
                                registered = registry.count(),
                                expected,
                                "repeater registered"
                            );
                        }
                        // Welcome every hello, duplicates included; the
                        // repeater keeps rebroadcasting until welcomed.
                        let welcome = MessageHeader::new(
                            MessageKind::WelcomeRepeater,
                            node.id.mask(),
                            MessageFlags::NONE,
                        );
                        if let Err(error) = udp.publish(welcome, &[]) {
                            warn!(node = node.id.value(), %error, "failed to send welcome");
                        }
                        if registry.count() >= expected {
                            let _ = tx.send(DiscoveryOutcome::Ready(registry));
                            return;
                        }
                    }
                    _ => warn!(
                        origin = message.header.origin_id.value(),
                        "malformed hello, ignoring"
                    ),
                }
            } else {
                trace!(kind = %message.header.kind, "ignoring message during handshake");
            }
        }

        if Instant::now() >= deadline {
            if registry.is_empty() {
                let _ = tx.send(DiscoveryOutcome::Failed(ClusterError::timeout(
                    "waiting for repeaters to register",
                )));
            } else {
                warn!(
                    registered = registry.count(),
                    expected, "handshake timed out, starting with the repeaters that registered"
                );
                let _ = tx.send(DiscoveryOutcome::Ready(registry));
            }
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitterStage {
    ReadyToSignalStartNewFrame,
    ProcessFrame,
    WaitingOnFramesDoneMsgs,
}

/// Steady-state frame loop on the emitter.
pub(crate) struct FrameSynchronization {
    registry: RemoteNodeRegistry,
    stage: EmitterStage,
    frame: u64,
    waiting_on: NodeMask,
    ack_deadline: Instant,
    state_buf: Vec<u8>,
}

impl FrameSynchronization {
    fn new(registry: RemoteNodeRegistry, max_frame_data_size: usize) -> Self {
        Self {
            registry,
            stage: EmitterStage::ReadyToSignalStartNewFrame,
            frame: 0,
            waiting_on: NodeMask::EMPTY,
            ack_deadline: Instant::now(),
            state_buf: vec![0u8; max_frame_data_size],
        }
    }

    fn do_frame(&mut self, ctx: &mut NodeCtx) -> Result<()> {
        loop {
            match self.stage {
                EmitterStage::ReadyToSignalStartNewFrame => {
                    if !self.start_new_frame(ctx)? {
                        // Capture failed; retry the whole publish next tick.
                        return Ok(());
                    }
                    self.stage = EmitterStage::ProcessFrame;
                    return Ok(());
                }
                EmitterStage::ProcessFrame => {
                    // Fast repeaters ack while we are still rendering.
                    self.drain_acks(ctx)?;
                    if !ctx.new_engine_frame {
                        return Ok(());
                    }
                    ctx.new_engine_frame = false;
                    self.ack_deadline = Instant::now() + ctx.config.communication_timeout;
                    self.stage = EmitterStage::WaitingOnFramesDoneMsgs;
                }
                EmitterStage::WaitingOnFramesDoneMsgs => {
                    self.drain_acks(ctx)?;
                    if self.waiting_on.is_empty() {
                        self.frame += 1;
                        self.stage = EmitterStage::ReadyToSignalStartNewFrame;
                        continue;
                    }
                    if Instant::now() >= self.ack_deadline {
                        self.evict_laggards(ctx);
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Captures and broadcasts the state for the current frame. Returns
    /// `Ok(false)` when capture failed and the publish must be retried.
    fn start_new_frame(&mut self, ctx: &mut NodeCtx) -> Result<bool> {
        let size = match gather_frame_state(ctx.bridge.as_mut(), self.frame, &mut self.state_buf) {
            Ok(size) => size,
            Err(error) if !error.is_fatal() => {
                error!(frame = self.frame, %error, "state capture failed, skipping publish");
                return Ok(false);
            }
            Err(error) => return Err(error),
        };

        let mut payload = BytesMut::with_capacity(AdvanceFrame::SIZE + size);
        AdvanceFrame {
            frame_number: self.frame,
        }
        .write_to(&mut payload);
        payload.extend_from_slice(&self.state_buf[..size]);

        let header = MessageHeader::new(
            MessageKind::StartFrame,
            self.registry.mask(),
            MessageFlags::BROADCAST,
        );
        ctx.udp.publish(header, &payload)?;

        self.waiting_on = if ctx.config.fence == FenceMode::Network {
            self.registry.mask()
        } else {
            NodeMask::EMPTY
        };
        debug!(
            frame = self.frame,
            state_bytes = size,
            waiting_on = %self.waiting_on,
            "frame start published"
        );
        Ok(true)
    }

    fn drain_acks(&mut self, ctx: &mut NodeCtx) -> Result<()> {
        while let Some(message) = ctx.udp.try_next_rx() {
            match message.header.kind {
                MessageKind::FrameDone => {
                    if ctx.config.fence != FenceMode::Network {
                        trace!(
                            origin = message.header.origin_id.value(),
                            "ack ignored, frames are externally fenced"
                        );
                        continue;
                    }
                    let Some(done) = FrameDone::read_from(&message.payload) else {
                        warn!(
                            origin = message.header.origin_id.value(),
                            "malformed FrameDone, ignoring"
                        );
                        continue;
                    };
                    if done.frame_number != self.frame {
                        return Err(ClusterError::FrameDesync {
                            origin: message.header.origin_id,
                            expected: self.frame,
                            received: done.frame_number,
                        });
                    }
                    self.waiting_on.clear(message.header.origin_id);
                    trace!(
                        origin = message.header.origin_id.value(),
                        frame = done.frame_number,
                        still_waiting = %self.waiting_on,
                        "frame done received"
                    );
                }
                MessageKind::HelloEmitter => {
                    // Joining a running cluster is not supported.
                    debug!(
                        origin = message.header.origin_id.value(),
                        "hello received after handshake, ignoring"
                    );
                }
                other => trace!(kind = %other, "unexpected message on emitter, ignoring"),
            }
        }
        Ok(())
    }

    fn evict_laggards(&mut self, ctx: &mut NodeCtx) {
        let laggards = self.waiting_on;
        for node in laggards.iter() {
            error!(
                node = node.value(),
                frame = self.frame,
                "repeater missed the ack deadline, evicting"
            );
            self.registry.unregister(node);
            ctx.udp.clear_node(node);
            self.waiting_on.clear(node);
        }
        if self.registry.is_empty() {
            error!("all repeaters evicted, emitter continuing alone");
        }
    }
}

/// The emitter node: owns the transport, the engine bridge, and whichever
/// protocol state is current.
pub struct EmitterNode {
    ctx: NodeCtx,
    state: EmitterState,
}

impl EmitterNode {
    pub(crate) fn new(ctx: NodeCtx) -> Result<Self> {
        let discovery = ClientDiscovery::spawn(
            Arc::clone(&ctx.udp),
            ctx.config.expected_repeater_count,
            ctx.config.handshake_timeout,
        )?;
        Ok(Self {
            ctx,
            state: EmitterState::WaitingForAllClients(discovery),
        })
    }

    pub fn do_frame(&mut self) {
        loop {
            let next = match &mut self.state {
                EmitterState::WaitingForAllClients(discovery) => match discovery.poll() {
                    Ok(None) => None,
                    Ok(Some(registry)) => {
                        info!(repeaters = registry.count(), "cluster handshake complete");
                        Some(EmitterState::SynchronizeFrame(FrameSynchronization::new(
                            registry,
                            self.ctx.config.max_frame_data_size,
                        )))
                    }
                    Err(error) => {
                        error!(%error, "cluster handshake failed");
                        Some(EmitterState::Fatal(FatalState::new(error)))
                    }
                },
                EmitterState::SynchronizeFrame(sync) => match sync.do_frame(&mut self.ctx) {
                    Ok(()) => None,
                    Err(error) => {
                        error!(frame = sync.frame, %error, "frame synchronization failed");
                        Some(EmitterState::Fatal(FatalState::new(error)))
                    }
                },
                EmitterState::Fatal(_) => None,
            };
            match next {
                Some(state) => self.state = state,
                None => return,
            }
        }
    }

    pub fn ready_to_proceed(&self) -> bool {
        match &self.state {
            EmitterState::WaitingForAllClients(_) => false,
            EmitterState::SynchronizeFrame(sync) => sync.stage == EmitterStage::ProcessFrame,
            EmitterState::Fatal(_) => true,
        }
    }

    pub fn conclude_frame(&mut self) {
        self.ctx.new_engine_frame = true;
    }

    pub fn current_frame_id(&self) -> u64 {
        match &self.state {
            EmitterState::SynchronizeFrame(sync) => sync.frame,
            _ => 0,
        }
    }

    pub fn fatal_error(&self) -> Option<&ClusterError> {
        match &self.state {
            EmitterState::Fatal(fatal) => Some(fatal.error()),
            _ => None,
        }
    }

    pub(crate) fn ctx(&self) -> &NodeCtx {
        &self.ctx
    }

    pub fn debug_status(&self) -> String {
        match &self.state {
            EmitterState::WaitingForAllClients(_) => "Emitter: waiting for repeaters".into(),
            EmitterState::SynchronizeFrame(sync) => format!(
                "Emitter: frame {} stage {:?} waiting on {}",
                sync.frame, sync.stage, sync.waiting_on
            ),
            EmitterState::Fatal(fatal) => format!("Emitter: fatal ({})", fatal.error()),
        }
    }
}

//! Repeater side of the lockstep protocol.
//!
//! A repeater announces itself until the emitter welcomes it, then
//! follows the frame loop: block for the expected frame start, restore
//! the emitter's state, render, ack, advance. Any frame-number mismatch
//! means this node has silently diverged and must stop.

use bytes::BytesMut;
use crossbeam_channel::{Receiver, TryRecvError};
use framelock_core::capture::apply_frame_state;
use framelock_core::config::{ClusterNodeConfig, FenceMode};
use framelock_core::wire::{AdvanceFrame, FrameDone, MessageFlags, MessageHeader, MessageKind, RolePublication};
use framelock_core::{ClusterError, NodeId, NodeMask, NodeRole, Result};
use framelock_network::UdpAgent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::node::{FatalState, NodeCtx};

/// Interval between hello rebroadcasts while unregistered.
const HELLO_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) enum RepeaterState {
    RegisterWithEmitter(EmitterDiscovery),
    SynchronizeFrame(FrameFollower),
    Fatal(FatalState),
}

enum RegistrationOutcome {
    Welcomed(NodeId),
    Failed(ClusterError),
}

/// Handshake stage: broadcasts hellos once a second until the emitter's
/// welcome arrives.
pub(crate) struct EmitterDiscovery {
    outcome: Receiver<RegistrationOutcome>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EmitterDiscovery {
    pub(crate) fn spawn(udp: Arc<UdpAgent>, timeout: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, outcome) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("framelock-register".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || registration_loop(udp, timeout, stop, tx)
            })
            .map_err(|e| {
                ClusterError::internal(format!("failed to spawn registration thread: {e}"))
            })?;
        Ok(Self {
            outcome,
            stop,
            thread: Some(thread),
        })
    }

    /// `Ok(Some(emitter))` once the emitter has welcomed us.
    fn poll(&mut self) -> Result<Option<NodeId>> {
        match self.outcome.try_recv() {
            Ok(RegistrationOutcome::Welcomed(emitter)) => Ok(Some(emitter)),
            Ok(RegistrationOutcome::Failed(error)) => Err(error),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ClusterError::internal(
                "registration thread exited unexpectedly",
            )),
        }
    }
}

impl Drop for EmitterDiscovery {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn registration_loop(
    udp: Arc<UdpAgent>,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    tx: crossbeam_channel::Sender<RegistrationOutcome>,
) {
    let deadline = Instant::now() + timeout;
    let mut next_hello = Instant::now();

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        if Instant::now() >= next_hello {
            let mut payload = BytesMut::with_capacity(RolePublication::SIZE);
            RolePublication {
                role: NodeRole::Repeater,
            }
            .write_to(&mut payload);
            let hello = MessageHeader::new(
                MessageKind::HelloEmitter,
                NodeMask::ALL,
                MessageFlags::BROADCAST | MessageFlags::DOES_NOT_REQUIRE_ACK,
            );
            if let Err(error) = udp.publish(hello, &payload) {
                warn!(%error, "failed to broadcast hello");
            }
            next_hello = Instant::now() + HELLO_INTERVAL;
        }

        if let Some(message) = udp.next_rx(Duration::from_millis(100)) {
            match message.header.kind {
                MessageKind::WelcomeRepeater => {
                    let _ = tx.send(RegistrationOutcome::Welcomed(message.header.origin_id));
                    return;
                }
                other => trace!(kind = %other, "ignoring message while unregistered"),
            }
        }

        if Instant::now() >= deadline {
            let _ = tx.send(RegistrationOutcome::Failed(ClusterError::timeout(
                "waiting for the emitter's welcome",
            )));
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeaterStage {
    WaitingOnGoFromEmitter,
    ReadyToProcessFrame,
}

/// Steady-state frame loop on a repeater.
pub(crate) struct FrameFollower {
    emitter: NodeId,
    stage: RepeaterStage,
    frame: u64,
    go_deadline: Instant,
}

impl FrameFollower {
    fn new(emitter: NodeId, config: &ClusterNodeConfig) -> Self {
        // The emitter may hold frame 0 until its own handshake window
        // closes, so the first deadline covers both.
        let first_frame_grace = config.handshake_timeout + config.communication_timeout;
        Self {
            emitter,
            stage: RepeaterStage::WaitingOnGoFromEmitter,
            frame: 0,
            go_deadline: Instant::now() + first_frame_grace,
        }
    }

    fn do_frame(&mut self, ctx: &mut NodeCtx) -> Result<()> {
        loop {
            match self.stage {
                RepeaterStage::WaitingOnGoFromEmitter => {
                    while let Some(message) = ctx.udp.try_next_rx() {
                        if self.handle_message(ctx, message)? {
                            break;
                        }
                    }
                    if self.stage == RepeaterStage::ReadyToProcessFrame {
                        return Ok(());
                    }
                    if Instant::now() >= self.go_deadline {
                        return Err(ClusterError::timeout(format!(
                            "waiting for the start of frame {}",
                            self.frame
                        )));
                    }
                    return Ok(());
                }
                RepeaterStage::ReadyToProcessFrame => {
                    if !ctx.new_engine_frame {
                        return Ok(());
                    }
                    ctx.new_engine_frame = false;
                    // Acks only pace the cluster under a network fence;
                    // otherwise an external barrier does.
                    if ctx.config.fence == FenceMode::Network {
                        self.signal_frame_done(ctx)?;
                    }
                    self.frame += 1;
                    self.go_deadline = Instant::now() + ctx.config.communication_timeout;
                    self.stage = RepeaterStage::WaitingOnGoFromEmitter;
                }
            }
        }
    }

    /// Returns `Ok(true)` when the expected frame start was consumed.
    fn handle_message(
        &mut self,
        ctx: &mut NodeCtx,
        message: framelock_network::ReceivedMessage,
    ) -> Result<bool> {
        match message.header.kind {
            MessageKind::StartFrame => {
                let Some(advance) = AdvanceFrame::read_from(&message.payload) else {
                    warn!("malformed StartFrame, ignoring");
                    return Ok(false);
                };
                if advance.frame_number != self.frame {
                    return Err(ClusterError::FrameDesync {
                        origin: message.header.origin_id,
                        expected: self.frame,
                        received: advance.frame_number,
                    });
                }
                apply_frame_state(
                    ctx.bridge.as_mut(),
                    self.frame,
                    &message.payload[AdvanceFrame::SIZE..],
                )?;
                debug!(frame = self.frame, "frame state restored");
                self.stage = RepeaterStage::ReadyToProcessFrame;
                Ok(true)
            }
            MessageKind::WelcomeRepeater => {
                // Duplicate welcome from the handshake crossing over.
                Ok(false)
            }
            other => {
                trace!(kind = %other, "unexpected message on repeater, ignoring");
                Ok(false)
            }
        }
    }

    fn signal_frame_done(&mut self, ctx: &mut NodeCtx) -> Result<()> {
        let mut payload = BytesMut::with_capacity(FrameDone::SIZE);
        FrameDone {
            frame_number: self.frame,
        }
        .write_to(&mut payload);
        let header = MessageHeader::new(
            MessageKind::FrameDone,
            self.emitter.mask(),
            MessageFlags::NONE,
        );
        ctx.udp.publish(header, &payload)?;
        trace!(frame = self.frame, "frame done signalled");
        Ok(())
    }
}

/// A repeater node: owns the transport, the engine bridge, and whichever
/// protocol state is current.
pub struct RepeaterNode {
    ctx: NodeCtx,
    state: RepeaterState,
}

impl RepeaterNode {
    pub(crate) fn new(ctx: NodeCtx) -> Result<Self> {
        let discovery = EmitterDiscovery::spawn(Arc::clone(&ctx.udp), ctx.config.handshake_timeout)?;
        Ok(Self {
            ctx,
            state: RepeaterState::RegisterWithEmitter(discovery),
        })
    }

    pub fn do_frame(&mut self) {
        loop {
            let next = match &mut self.state {
                RepeaterState::RegisterWithEmitter(discovery) => match discovery.poll() {
                    Ok(None) => None,
                    Ok(Some(emitter)) => {
                        info!(emitter = emitter.value(), "registered with the emitter");
                        Some(RepeaterState::SynchronizeFrame(FrameFollower::new(
                            emitter,
                            &self.ctx.config,
                        )))
                    }
                    Err(error) => {
                        error!(%error, "registration with the emitter failed");
                        Some(RepeaterState::Fatal(FatalState::new(error)))
                    }
                },
                RepeaterState::SynchronizeFrame(follower) => {
                    match follower.do_frame(&mut self.ctx) {
                        Ok(()) => None,
                        Err(error) => {
                            error!(frame = follower.frame, %error, "frame following failed");
                            Some(RepeaterState::Fatal(FatalState::new(error)))
                        }
                    }
                }
                RepeaterState::Fatal(_) => None,
            };
            match next {
                Some(state) => self.state = state,
                None => return,
            }
        }
    }

    pub fn ready_to_proceed(&self) -> bool {
        match &self.state {
            RepeaterState::RegisterWithEmitter(_) => false,
            RepeaterState::SynchronizeFrame(follower) => {
                follower.stage == RepeaterStage::ReadyToProcessFrame
            }
            RepeaterState::Fatal(_) => true,
        }
    }

    pub fn conclude_frame(&mut self) {
        self.ctx.new_engine_frame = true;
    }

    pub fn current_frame_id(&self) -> u64 {
        match &self.state {
            RepeaterState::SynchronizeFrame(follower) => follower.frame,
            _ => 0,
        }
    }

    pub fn fatal_error(&self) -> Option<&ClusterError> {
        match &self.state {
            RepeaterState::Fatal(fatal) => Some(fatal.error()),
            _ => None,
        }
    }

    pub(crate) fn ctx(&self) -> &NodeCtx {
        &self.ctx
    }

    pub fn debug_status(&self) -> String {
        match &self.state {
            RepeaterState::RegisterWithEmitter(_) => "Repeater: registering with emitter".into(),
            RepeaterState::SynchronizeFrame(follower) => format!(
                "Repeater: frame {} stage {:?}",
                follower.frame, follower.stage
            ),
            RepeaterState::Fatal(fatal) => format!("Repeater: fatal ({})", fatal.error()),
        }
    }
}

//! Multi-node test harness.
//!
//! Each node runs on its own thread in the same host-loop shape a real
//! engine would use: poll `do_frame` until the protocol is ready,
//! "render", conclude, repeat.

use framelock_core::config::UdpAgentConfig;
use framelock_node::ClusterNode;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What happened while driving one node.
#[derive(Debug, Clone)]
pub struct DriveReport {
    /// Frames rendered and concluded before stopping.
    pub completed_frames: u64,
    /// The fatal error that stopped the node, if any.
    pub fatal: Option<String>,
}

/// Runs the host loop for `frames` frames. Stops early on a fatal error
/// or when one frame takes longer than `step_timeout` to unblock.
pub fn drive(mut node: ClusterNode, frames: u64, step_timeout: Duration) -> (ClusterNode, DriveReport) {
    let mut completed = 0;
    'frames: for _ in 0..frames {
        let deadline = Instant::now() + step_timeout;
        loop {
            node.do_frame();
            if node.fatal_error().is_some() {
                break 'frames;
            }
            if node.ready_to_proceed() {
                break;
            }
            if Instant::now() >= deadline {
                break 'frames;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // Rendering would happen here.
        node.conclude_frame();
        completed += 1;
    }
    // Flush the conclude of the last frame (a repeater's final ack goes
    // out on this tick).
    node.do_frame();

    let fatal = node.fatal_error().map(|e| e.to_string());
    (
        node,
        DriveReport {
            completed_frames: completed,
            fatal,
        },
    )
}

/// [`drive`], on its own thread.
pub fn spawn_driver(
    node: ClusterNode,
    frames: u64,
    step_timeout: Duration,
) -> JoinHandle<(ClusterNode, DriveReport)> {
    std::thread::spawn(move || drive(node, frames, step_timeout))
}

static NEXT_CLUSTER: AtomicU16 = AtomicU16::new(0);

/// A multicast group and port no other test in this process is using.
/// The process id is folded in so parallel test binaries stay apart too.
pub fn test_udp_config() -> UdpAgentConfig {
    let cluster = NEXT_CLUSTER.fetch_add(1, Ordering::Relaxed);
    let lane = (std::process::id() % 97) as u16;
    UdpAgentConfig::default()
        .with_multicast_addr(Ipv4Addr::new(224, 0, 3, 1 + (cluster % 200) as u8))
        .with_port(30_000 + lane * 250 + (cluster % 250))
}

/// Installs a test subscriber honoring `RUST_LOG`; safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

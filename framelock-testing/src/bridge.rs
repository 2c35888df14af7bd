//! Deterministic in-memory engine bridge.
//!
//! Stands in for a real engine in tests: the emitter side synthesizes a
//! reproducible snapshot per frame, the repeater side records what it
//! restored. Comparing the two histories checks the protocol's whole
//! point, that every node observes the same state for the same frame.

use bytes::{Buf, BufMut};
use framelock_core::capture::StateCaptureBridge;
use framelock_core::{ClusterError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// The synchronized engine state, one field per subsystem section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineSnapshot {
    pub input_axis: i32,
    pub frame_time_us: u64,
    pub cluster_buttons: u32,
    pub rng_seed: u64,
}

impl EngineSnapshot {
    /// The snapshot a healthy emitter produces for `frame`.
    pub fn for_frame(frame: u64) -> Self {
        Self {
            input_axis: frame as i32 * 3 - 1,
            frame_time_us: 16_666 * (frame + 1),
            cluster_buttons: (frame as u32).wrapping_mul(0x9e37_79b9),
            rng_seed: frame.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1),
        }
    }
}

/// `(frame, snapshot)` pairs in the order they were published or applied.
pub type History = Arc<Mutex<Vec<(u64, EngineSnapshot)>>>;

enum Mode {
    /// Emitter side: synthesizes state, records what it published.
    Source,
    /// Repeater side: records what it restored.
    Mirror,
}

/// [`StateCaptureBridge`] over an [`EngineSnapshot`] instead of a real
/// engine.
pub struct InMemoryBridge {
    mode: Mode,
    snapshot: EngineSnapshot,
    history: History,
}

impl InMemoryBridge {
    /// Emitter-side bridge. The returned [`History`] fills with the
    /// snapshot published for each frame.
    pub fn source() -> (Box<Self>, History) {
        Self::with_mode(Mode::Source)
    }

    /// Repeater-side bridge. The returned [`History`] fills with the
    /// snapshot restored for each frame.
    pub fn mirror() -> (Box<Self>, History) {
        Self::with_mode(Mode::Mirror)
    }

    fn with_mode(mode: Mode) -> (Box<Self>, History) {
        let snapshot = match mode {
            Mode::Source => EngineSnapshot::for_frame(0),
            Mode::Mirror => EngineSnapshot::default(),
        };
        let history: History = Arc::new(Mutex::new(Vec::new()));
        let bridge = Box::new(Self {
            mode,
            snapshot,
            history: Arc::clone(&history),
        });
        (bridge, history)
    }

    fn need(buf: &[u8], bytes: usize, what: &str) -> Result<()> {
        if buf.len() < bytes {
            return Err(ClusterError::state_bridge(format!(
                "{what}: need {bytes} bytes, have {}",
                buf.len()
            )));
        }
        Ok(())
    }
}

impl StateCaptureBridge for InMemoryBridge {
    fn save_input_state(&mut self, mut buf: &mut [u8]) -> Result<usize> {
        Self::need(buf, 4, "input state")?;
        buf.put_i32_le(self.snapshot.input_axis);
        Ok(4)
    }

    fn restore_input_state(&mut self, mut data: &[u8]) -> Result<()> {
        Self::need(data, 4, "input state")?;
        self.snapshot.input_axis = data.get_i32_le();
        Ok(())
    }

    fn save_time_state(&mut self, mut buf: &mut [u8]) -> Result<usize> {
        Self::need(buf, 8, "time state")?;
        buf.put_u64_le(self.snapshot.frame_time_us);
        Ok(8)
    }

    fn restore_time_state(&mut self, mut data: &[u8]) -> Result<()> {
        Self::need(data, 8, "time state")?;
        self.snapshot.frame_time_us = data.get_u64_le();
        Ok(())
    }

    fn save_cluster_input_state(&mut self, mut buf: &mut [u8]) -> Result<usize> {
        Self::need(buf, 4, "cluster input state")?;
        buf.put_u32_le(self.snapshot.cluster_buttons);
        Ok(4)
    }

    fn restore_cluster_input_state(&mut self, mut data: &[u8]) -> Result<()> {
        Self::need(data, 4, "cluster input state")?;
        self.snapshot.cluster_buttons = data.get_u32_le();
        Ok(())
    }

    fn save_random_state(&mut self, mut buf: &mut [u8]) -> Result<usize> {
        Self::need(buf, 8, "random state")?;
        buf.put_u64_le(self.snapshot.rng_seed);
        Ok(8)
    }

    fn restore_random_state(&mut self, mut data: &[u8]) -> Result<()> {
        Self::need(data, 8, "random state")?;
        self.snapshot.rng_seed = data.get_u64_le();
        Ok(())
    }

    fn latch_rpc_calls(&mut self, frame: u64, mut buf: &mut [u8]) -> Result<usize> {
        if matches!(self.mode, Mode::Source) {
            // Latch runs last in a gather, so this frame's snapshot has
            // been fully serialized by now; roll the engine forward.
            self.history.lock().push((frame, self.snapshot));
            self.snapshot = EngineSnapshot::for_frame(frame + 1);
        }
        Self::need(buf, 8, "rpc calls")?;
        buf.put_u64_le(frame);
        Ok(8)
    }

    fn unlatch_rpc_calls(&mut self, frame: u64, mut data: &[u8]) -> Result<()> {
        Self::need(data, 8, "rpc calls")?;
        let latched_for = data.get_u64_le();
        if latched_for != frame {
            return Err(ClusterError::state_bridge(format!(
                "rpc batch latched for frame {latched_for}, applied at frame {frame}"
            )));
        }
        if matches!(self.mode, Mode::Mirror) {
            self.history.lock().push((frame, self.snapshot));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelock_core::capture::{apply_frame_state, gather_frame_state};

    #[test]
    fn mirror_reproduces_source_history() {
        let (mut source, published) = InMemoryBridge::source();
        let (mut mirror, applied) = InMemoryBridge::mirror();

        let mut buf = vec![0u8; 1024];
        for frame in 0..5u64 {
            let size = gather_frame_state(source.as_mut(), frame, &mut buf).unwrap();
            apply_frame_state(mirror.as_mut(), frame, &buf[..size]).unwrap();
        }

        let published = published.lock();
        let applied = applied.lock();
        assert_eq!(published.len(), 5);
        assert_eq!(*published, *applied);
    }
}

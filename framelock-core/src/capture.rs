//! State capture and restoration at the engine boundary.
//!
//! The synchronization protocol never interprets engine state itself; it
//! moves opaque bytes. [`StateCaptureBridge`] is the seam where a host
//! engine plugs in its own serialization for each synchronized subsystem.

use crate::frame_data::{SectionId, SectionReader, SectionWriter};
use crate::Result;
use tracing::warn;

/// Hooks into the host engine for saving state on the emitter and
/// restoring it on repeaters.
///
/// Save hooks write into the provided buffer and return the byte count.
/// Restore hooks receive exactly the bytes the matching save hook wrote.
/// RPC calls are latched per frame so a call issued during frame `n` on
/// the emitter executes during frame `n` on every repeater.
pub trait StateCaptureBridge: Send {
    fn save_input_state(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn restore_input_state(&mut self, data: &[u8]) -> Result<()>;

    fn save_time_state(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn restore_time_state(&mut self, data: &[u8]) -> Result<()>;

    fn save_cluster_input_state(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn restore_cluster_input_state(&mut self, data: &[u8]) -> Result<()>;

    fn save_random_state(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn restore_random_state(&mut self, data: &[u8]) -> Result<()>;

    /// Captures the RPC calls queued during `frame` on the emitter.
    fn latch_rpc_calls(&mut self, frame: u64, buf: &mut [u8]) -> Result<usize>;
    /// Replays latched RPC calls for `frame` on a repeater.
    fn unlatch_rpc_calls(&mut self, frame: u64, data: &[u8]) -> Result<()>;
}

/// Captures every synchronized subsystem for `frame` into `buf` as a
/// tagged-section list. Returns the total encoded size.
///
/// Any failing save hook aborts the whole capture; a partial state blob
/// must never go on the wire.
pub fn gather_frame_state(
    bridge: &mut dyn StateCaptureBridge,
    frame: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let mut writer = SectionWriter::new(buf);
    writer.write_section(SectionId::INPUT_STATE, |out| bridge.save_input_state(out))?;
    writer.write_section(SectionId::TIME_STATE, |out| bridge.save_time_state(out))?;
    writer.write_section(SectionId::CLUSTER_INPUT_STATE, |out| {
        bridge.save_cluster_input_state(out)
    })?;
    writer.write_section(SectionId::RANDOM_STATE, |out| bridge.save_random_state(out))?;
    writer.write_section(SectionId::RPC_CALLS, |out| bridge.latch_rpc_calls(frame, out))?;
    writer.finish()
}

/// Restores every recognized section of `data` into the engine for `frame`.
///
/// Unknown section ids are skipped so newer emitters interoperate with
/// older repeaters. A restore hook failure is logged and the remaining
/// sections still apply; a malformed stream is fatal and propagates.
pub fn apply_frame_state(
    bridge: &mut dyn StateCaptureBridge,
    frame: u64,
    data: &[u8],
) -> Result<()> {
    for section in SectionReader::new(data) {
        let section = section?;
        let restored = match section.id {
            SectionId::INPUT_STATE => bridge.restore_input_state(section.data),
            SectionId::TIME_STATE => bridge.restore_time_state(section.data),
            SectionId::CLUSTER_INPUT_STATE => bridge.restore_cluster_input_state(section.data),
            SectionId::RANDOM_STATE => bridge.restore_random_state(section.data),
            SectionId::RPC_CALLS => bridge.unlatch_rpc_calls(frame, section.data),
            other => {
                warn!(section = %other, "skipping unrecognized state section");
                Ok(())
            }
        };
        if let Err(error) = restored {
            warn!(section = %section.id, %error, "failed to restore state section");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterError;

    #[derive(Default)]
    struct RecordingBridge {
        restored: Vec<SectionId>,
        rpc_frames: Vec<u64>,
        fail_time_restore: bool,
    }

    impl RecordingBridge {
        fn save(tag: u8, buf: &mut [u8]) -> Result<usize> {
            buf[0] = tag;
            Ok(1)
        }
    }

    impl StateCaptureBridge for RecordingBridge {
        fn save_input_state(&mut self, buf: &mut [u8]) -> Result<usize> {
            Self::save(1, buf)
        }
        fn restore_input_state(&mut self, _data: &[u8]) -> Result<()> {
            self.restored.push(SectionId::INPUT_STATE);
            Ok(())
        }
        fn save_time_state(&mut self, buf: &mut [u8]) -> Result<usize> {
            Self::save(2, buf)
        }
        fn restore_time_state(&mut self, _data: &[u8]) -> Result<()> {
            if self.fail_time_restore {
                return Err(ClusterError::state_bridge("time subsystem rejected state"));
            }
            self.restored.push(SectionId::TIME_STATE);
            Ok(())
        }
        fn save_cluster_input_state(&mut self, buf: &mut [u8]) -> Result<usize> {
            Self::save(3, buf)
        }
        fn restore_cluster_input_state(&mut self, _data: &[u8]) -> Result<()> {
            self.restored.push(SectionId::CLUSTER_INPUT_STATE);
            Ok(())
        }
        fn save_random_state(&mut self, buf: &mut [u8]) -> Result<usize> {
            Self::save(4, buf)
        }
        fn restore_random_state(&mut self, _data: &[u8]) -> Result<()> {
            self.restored.push(SectionId::RANDOM_STATE);
            Ok(())
        }
        fn latch_rpc_calls(&mut self, frame: u64, buf: &mut [u8]) -> Result<usize> {
            self.rpc_frames.push(frame);
            Self::save(5, buf)
        }
        fn unlatch_rpc_calls(&mut self, frame: u64, _data: &[u8]) -> Result<()> {
            self.rpc_frames.push(frame);
            self.restored.push(SectionId::RPC_CALLS);
            Ok(())
        }
    }

    #[test]
    fn gather_then_apply_hits_every_subsystem() {
        let mut emitter = RecordingBridge::default();
        let mut buf = vec![0u8; 1024];
        let total = gather_frame_state(&mut emitter, 42, &mut buf).unwrap();
        assert_eq!(emitter.rpc_frames, vec![42]);

        let mut repeater = RecordingBridge::default();
        apply_frame_state(&mut repeater, 42, &buf[..total]).unwrap();
        assert_eq!(
            repeater.restored,
            vec![
                SectionId::INPUT_STATE,
                SectionId::TIME_STATE,
                SectionId::CLUSTER_INPUT_STATE,
                SectionId::RANDOM_STATE,
                SectionId::RPC_CALLS,
            ]
        );
        assert_eq!(repeater.rpc_frames, vec![42]);
    }

    #[test]
    fn failed_restore_does_not_stop_later_sections() {
        let mut emitter = RecordingBridge::default();
        let mut buf = vec![0u8; 1024];
        let total = gather_frame_state(&mut emitter, 7, &mut buf).unwrap();

        let mut repeater = RecordingBridge {
            fail_time_restore: true,
            ..Default::default()
        };
        apply_frame_state(&mut repeater, 7, &buf[..total]).unwrap();
        assert!(!repeater.restored.contains(&SectionId::TIME_STATE));
        assert!(repeater.restored.contains(&SectionId::RANDOM_STATE));
        assert!(repeater.restored.contains(&SectionId::RPC_CALLS));
    }

    #[test]
    fn corrupt_stream_propagates() {
        let mut repeater = RecordingBridge::default();
        let err = apply_frame_state(&mut repeater, 0, &[9, 0, 0]).unwrap_err();
        assert!(err.is_fatal());
    }
}

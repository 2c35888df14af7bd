//! # Error Types
//!
//! Error handling for the Framelock lockstep protocol.

use crate::frame_data::SectionId;
use crate::NodeId;
use thiserror::Error;

/// Error types that can occur while running the lockstep protocol.
///
/// # Error Categories
///
/// - **Wire errors**: truncated or corrupt message buffers
/// - **Transport errors**: socket setup and addressing failures
/// - **Protocol errors**: lockstep violations (frame-number desync)
/// - **Capacity errors**: state sections that do not fit the frame buffer
/// - **Timeout errors**: handshake or steady-state waits that expired
///
/// Protocol desync and a corrupt state stream are fatal: determinism has
/// already been lost and the node must stop. Most other conditions are
/// handled locally (logged, skipped, or resolved by eviction) and never
/// cross the `do_frame` boundary.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Buffer too short to hold the expected fixed-layout struct.
    #[error("truncated message: need {needed} bytes, have {available}")]
    TruncatedMessage { needed: usize, available: usize },

    /// Message carried a type tag this protocol version does not know.
    #[error("unknown message kind tag {tag}")]
    UnknownMessageKind { tag: u8 },

    /// Message carried an incompatible protocol version byte.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u8 },

    /// Network transport failure (socket setup, bad destination, ...).
    #[error("network error: {message}")]
    Network { message: String },

    /// Frame-number mismatch between what was expected and what arrived.
    /// The node has fallen out of lockstep and cannot safely continue.
    #[error("frame desync with node {origin}: expected frame {expected}, received {received}")]
    FrameDesync {
        origin: NodeId,
        expected: u64,
        received: u64,
    },

    /// A state section did not fit in the supplied buffer.
    #[error("buffer too small for section {section}: need {needed} bytes, have {available}")]
    BufferTooSmall {
        section: SectionId,
        needed: usize,
        available: usize,
    },

    /// The tagged-section list could not even be scanned (length or id
    /// prefix cut short). Unlike a too-large section this is unrecoverable.
    #[error("corrupt state stream: {details}")]
    CorruptStateStream { details: String },

    /// A wait bounded by configuration expired.
    #[error("timeout during {operation}")]
    Timeout { operation: String },

    /// State capture/restore collaborator failure.
    #[error("state bridge error: {message}")]
    StateBridge { message: String },

    /// File system or socket I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in the Framelock protocol crates.
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Creates a new network error with the given message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a new corrupt-state-stream error with the given detail.
    pub fn corrupt_stream(details: impl Into<String>) -> Self {
        Self::CorruptStateStream {
            details: details.into(),
        }
    }

    /// Creates a new timeout error naming the operation that expired.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new state-bridge error with the given message.
    pub fn state_bridge(message: impl Into<String>) -> Self {
        Self::StateBridge {
            message: message.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this condition forces the node into the terminal
    /// `FatalError` state.
    ///
    /// Desync and stream corruption mean determinism is lost; everything
    /// else is handled in place (logged, skipped, or resolved by the
    /// protocol's own timeout/eviction logic).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FrameDesync { .. } | Self::CorruptStateStream { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        let desync = ClusterError::FrameDesync {
            origin: NodeId::new(2).unwrap(),
            expected: 5,
            received: 7,
        };
        assert!(desync.is_fatal());

        assert!(ClusterError::corrupt_stream("cut short").is_fatal());
        assert!(!ClusterError::network("send failed").is_fatal());
        assert!(!ClusterError::timeout("handshake").is_fatal());
    }
}

//! # Feedback Error Types
//!
//! All errors that can cross the feedback layer boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::{BufferId, ProgramId, VertexBindingId};

/// Failures reported by a [`GpuDevice`](crate::GpuDevice) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The buffer id was never created or was destroyed.
    #[error("unknown {0}")]
    UnknownBuffer(BufferId),

    /// The program id was never created or was destroyed.
    #[error("unknown {0}")]
    UnknownProgram(ProgramId),

    /// The vertex binding id was never created or was destroyed.
    #[error("unknown {0}")]
    UnknownBinding(VertexBindingId),

    /// The buffer exists but has no storage yet.
    #[error("{0} is not allocated")]
    NotAllocated(BufferId),

    /// A write or capture does not fit the allocated storage.
    #[error("{buffer} holds {capacity} bytes, {required} required")]
    OutOfRange {
        /// Target buffer.
        buffer: BufferId,
        /// Allocated bytes.
        capacity: usize,
        /// Bytes the operation needed.
        required: usize,
    },

    /// Reading a shader source failed.
    #[error("cannot read {path}: {message}", path = .path.display())]
    Io {
        /// Source path.
        path: PathBuf,
        /// OS error text.
        message: String,
    },

    /// A shader source did not compile.
    #[error("compile failed for {path}: {message}", path = .path.display())]
    Compile {
        /// Source path.
        path: PathBuf,
        /// Compiler log.
        message: String,
    },

    /// Linking failed.
    #[error("link failed: {0}")]
    Link(String),

    /// A capture call arrived in the wrong state (nested begin, draw outside a block).
    #[error("invalid capture state: {0}")]
    CaptureState(&'static str),

    /// Mapping a buffer for readback failed.
    #[error("buffer map failed: {0}")]
    Map(String),

    /// The graphics back-end is unavailable or rejected a command.
    #[error("back-end error: {0}")]
    Backend(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors surfaced by the feedback shader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    /// The program is not linked; stepping is refused.
    #[error("feedback program is not loaded")]
    NotLoaded,

    /// No stream is registered under this logical name.
    #[error("invalid name: no stream named '{0}'")]
    UnknownStream(String),

    /// Element byte width does not match the stream's component count.
    #[error("invalid element size for '{stream}': expected {expected} bytes, got {actual}")]
    ElementWidth {
        /// Stream name.
        stream: String,
        /// `components × 4`.
        expected: usize,
        /// Width supplied by the caller.
        actual: usize,
    },

    /// Element count does not match the particle count.
    #[error("invalid size for '{stream}': expected {expected} elements, got {actual}")]
    ElementCount {
        /// Stream name.
        stream: String,
        /// Particle count.
        expected: usize,
        /// Elements supplied by the caller.
        actual: usize,
    },

    /// `recall_initial_data` on a stream that never received initial data.
    #[error("no initial data stored for '{0}'")]
    NoSnapshot(String),

    /// The feedback program has no input location for a stream.
    #[error("program has no input '{attribute}' for stream '{stream}'")]
    UnresolvedAttribute {
        /// Stream name.
        stream: String,
        /// Attribute name looked up in the program.
        attribute: String,
    },

    /// The target program of an attach has no such attribute.
    #[error("invalid target name: '{0}'")]
    UnknownTargetAttribute(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The device rejected an operation.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl FeedbackError {
    /// Emits this error on the feedback log channel and hands it back.
    #[must_use]
    pub fn logged(self) -> Self {
        tracing::error!(target: crate::LOG_TARGET, "{}", self);
        self
    }
}

/// Result type for feedback operations.
pub type FeedbackResult<T> = Result<T, FeedbackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_stream() {
        let err = FeedbackError::ElementCount {
            stream: "position".into(),
            expected: 16,
            actual: 3,
        };
        let text = err.to_string();
        assert!(text.contains("position"));
        assert!(text.contains("16"));
    }

    #[test]
    fn test_device_error_converts() {
        let err: FeedbackError = DeviceError::NotAllocated(BufferId(7)).into();
        assert_eq!(err, FeedbackError::Device(DeviceError::NotAllocated(BufferId(7))));
        assert_eq!(err.to_string(), "buffer#7 is not allocated");
    }
}

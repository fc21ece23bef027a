//! Error types for the stepper library.
//!
//! The positioning state machine itself has no failure modes; the only
//! fallible operation is decoding a command frame received from the network.

use core::fmt;

/// Errors that can occur while decoding a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The frame did not carry exactly [`FRAME_LEN`](crate::command::FRAME_LEN) bytes.
    /// The frame is discarded and the motor state is left untouched.
    InvalidLength {
        /// Number of bytes actually received.
        len: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::InvalidLength { len } => write!(
                f,
                "Invalid frame length: expected {} bytes, got {}",
                crate::command::FRAME_LEN,
                len
            ),
        }
    }
}

impl core::error::Error for FrameError {}

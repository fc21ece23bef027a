//! Binary command frames.
//!
//! A frame is exactly four bytes carrying a two's-complement absolute target
//! position. The sending client assembles it most-significant byte first.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::motor::StepperMotor;
use crate::output::CoilOutput;

/// Length of a command frame in bytes.
pub const FRAME_LEN: usize = 4;

/// Byte order used to assemble the target position from a frame.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// `frame[0]` is the most significant byte.
    #[default]
    BigEndian,
    /// `frame[0]` is the least significant byte.
    LittleEndian,
}

/// Decode a frame as a most-significant-byte-first `i32`.
///
/// # Errors
///
/// Returns `Err(FrameError::InvalidLength)` unless `frame` is exactly
/// [`FRAME_LEN`] bytes long.
pub fn decode(frame: &[u8]) -> Result<i32, FrameError> {
    decode_with(frame, ByteOrder::BigEndian)
}

/// Decode a frame using an explicit byte order.
///
/// # Errors
///
/// Returns `Err(FrameError::InvalidLength)` unless `frame` is exactly
/// [`FRAME_LEN`] bytes long.
pub fn decode_with(frame: &[u8], order: ByteOrder) -> Result<i32, FrameError> {
    let bytes: [u8; FRAME_LEN] = frame
        .try_into()
        .map_err(|_| FrameError::InvalidLength { len: frame.len() })?;
    Ok(match order {
        ByteOrder::BigEndian => i32::from_be_bytes(bytes),
        ByteOrder::LittleEndian => i32::from_le_bytes(bytes),
    })
}

/// Decode `frame` and, on success, make the result the motor's new target.
///
/// A rejected frame leaves the motor untouched. Returns the accepted target.
pub fn dispatch<O: CoilOutput>(
    frame: &[u8],
    order: ByteOrder,
    motor: &mut StepperMotor<O>,
) -> Result<i32, FrameError> {
    let target = decode_with(frame, order)?;
    motor.set_target_pos(target);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{CoilPattern, StepMode};
    use core::time::Duration;

    struct NullCoils;

    impl CoilOutput for NullCoils {
        fn set_coils(&mut self, _pattern: CoilPattern) {}
    }

    #[test]
    fn test_decode_positive() {
        assert_eq!(decode(&[0x00, 0x00, 0x00, 0x05]), Ok(5));
        assert_eq!(decode(&[0x00, 0x01, 0x02, 0x03]), Ok(0x0001_0203));
    }

    #[test]
    fn test_decode_negative_twos_complement() {
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF, 0xFB]), Ok(-5));
        assert_eq!(decode(&[0x80, 0x00, 0x00, 0x00]), Ok(i32::MIN));
        assert_eq!(decode(&[0x7F, 0xFF, 0xFF, 0xFF]), Ok(i32::MAX));
    }

    #[test]
    fn test_decode_little_endian() {
        assert_eq!(decode_with(&[0x05, 0x00, 0x00, 0x00], ByteOrder::LittleEndian), Ok(5));
        assert_eq!(decode_with(&[0xFB, 0xFF, 0xFF, 0xFF], ByteOrder::LittleEndian), Ok(-5));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(decode(&[0x00, 0x00, 0x05]), Err(FrameError::InvalidLength { len: 3 }));
        assert_eq!(decode(&[]), Err(FrameError::InvalidLength { len: 0 }));
        assert_eq!(decode(&[0; 5]), Err(FrameError::InvalidLength { len: 5 }));
    }

    #[test]
    fn test_dispatch_sets_target() {
        let mut motor = StepperMotor::new(NullCoils, StepMode::Half, Duration::from_millis(1));
        assert_eq!(dispatch(&[0, 0, 1, 0], ByteOrder::BigEndian, &mut motor), Ok(256));
        assert_eq!(motor.target_position(), 256);
    }

    #[test]
    fn test_dispatch_short_frame_leaves_motor_untouched() {
        let mut motor = StepperMotor::new(NullCoils, StepMode::Half, Duration::from_millis(1));
        motor.set_target_pos(42);

        let result = dispatch(&[0, 0, 5], ByteOrder::BigEndian, &mut motor);
        assert_eq!(result, Err(FrameError::InvalidLength { len: 3 }));
        assert_eq!(motor.target_position(), 42);
        assert_eq!(motor.current_position(), 0);
        assert_eq!(motor.phase_index(), 0);
    }

    #[test]
    fn test_error_display() {
        let msg = FrameError::InvalidLength { len: 3 }.to_string();
        assert_eq!(msg, "Invalid frame length: expected 4 bytes, got 3");
    }
}

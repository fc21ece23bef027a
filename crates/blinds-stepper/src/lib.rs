#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = "A `no_std` library for driving a 4-phase unipolar stepper motor."]
#![doc = ""]
#![doc = "This crate provides the coil energization sequences, a non-blocking"]
#![doc = "positioning state machine and the binary command decoder used to set its target."]

pub mod command;
pub mod error;
pub mod motor;
pub mod output;
pub mod sequence;

pub use command::{ByteOrder, FRAME_LEN, decode, decode_with, dispatch};
pub use error::FrameError;
pub use motor::{Direction, Step, StepperMotor};
pub use output::{CoilOutput, PinCoils};
pub use sequence::{COIL_LINES, CoilPattern, StepMode, pattern};

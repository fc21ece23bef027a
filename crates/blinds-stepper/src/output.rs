//! The seam between the state machine and the physical coil lines.

use embedded_hal::digital::OutputPin;

use crate::sequence::{COIL_LINES, CoilPattern};

/// Sink for coil energization patterns.
///
/// The state machine calls [`set_coils`](CoilOutput::set_coils) exactly once per
/// successful phase advance. Lines are write-only from the core's point of view,
/// so implementations deal with their own faults and never report back.
pub trait CoilOutput {
    /// Drive lines IN1..IN4 to match `pattern`.
    fn set_coils(&mut self, pattern: CoilPattern);
}

impl<T: CoilOutput + ?Sized> CoilOutput for &mut T {
    fn set_coils(&mut self, pattern: CoilPattern) {
        (**self).set_coils(pattern);
    }
}

/// Drives four `embedded-hal` output pins, IN1 first.
///
/// Pin errors are counted rather than propagated; see [`PinCoils::faults`].
pub struct PinCoils<P> {
    pins: [P; COIL_LINES],
    faults: u32,
}

impl<P: OutputPin> PinCoils<P> {
    /// Take ownership of the four coil pins. Lines are left as they are until
    /// the first pattern is written.
    pub fn new(pins: [P; COIL_LINES]) -> Self {
        PinCoils { pins, faults: 0 }
    }

    /// Number of pin writes that failed since construction.
    pub fn faults(&self) -> u32 {
        self.faults
    }

    /// Give the pins back.
    pub fn release(self) -> [P; COIL_LINES] {
        self.pins
    }
}

impl<P: OutputPin> CoilOutput for PinCoils<P> {
    fn set_coils(&mut self, pattern: CoilPattern) {
        for (pin, on) in self.pins.iter_mut().zip(pattern.lines()) {
            let result = if on { pin.set_high() } else { pin.set_low() };
            if result.is_err() {
                self.faults = self.faults.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::{ErrorKind, ErrorType};

    // Mock pin that tracks its level
    #[derive(Default)]
    struct MockPin {
        high: bool,
    }

    impl ErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.high = true;
            Ok(())
        }
    }

    // Mock pin whose every write fails
    struct BrokenPin;

    impl ErrorType for BrokenPin {
        type Error = ErrorKind;
    }

    impl OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }
    }

    #[test]
    fn test_pin_coils_follow_pattern() {
        let mut coils = PinCoils::new([
            MockPin::default(),
            MockPin::default(),
            MockPin::default(),
            MockPin::default(),
        ]);

        coils.set_coils(CoilPattern::from_bits(0b1001));
        let levels: Vec<bool> = coils.pins.iter().map(|p| p.high).collect();
        assert_eq!(levels, [true, false, false, true]);

        coils.set_coils(CoilPattern::from_bits(0b0110));
        let levels: Vec<bool> = coils.release().iter().map(|p| p.high).collect();
        assert_eq!(levels, [false, true, true, false]);
    }

    #[test]
    fn test_pin_faults_are_counted_not_propagated() {
        let mut coils = PinCoils::new([BrokenPin, BrokenPin, BrokenPin, BrokenPin]);
        coils.set_coils(CoilPattern::from_bits(0b0011));
        coils.set_coils(CoilPattern::OFF);
        assert_eq!(coils.faults(), 8);
    }
}

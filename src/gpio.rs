use anyhow::Context;
use blinds_stepper::{COIL_LINES, CoilOutput, CoilPattern};
use sysfs_gpio::{Direction, Pin};
use tracing::{info, trace, warn};

use crate::config::{GpioBackend, GpioSettings};

/// Dry-run output: logs every pattern and remembers the last one.
#[derive(Debug, Default)]
pub struct LogCoils {
    last: Option<CoilPattern>,
    writes: u64,
}

#[cfg(test)]
impl LogCoils {
    pub fn last(&self) -> Option<CoilPattern> {
        self.last
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl CoilOutput for LogCoils {
    fn set_coils(&mut self, pattern: CoilPattern) {
        self.writes += 1;
        trace!(coils = %pattern, previous = ?self.last, writes = self.writes, "set coils");
        self.last = Some(pattern);
    }
}

/// Coil lines exported through the Linux sysfs GPIO interface.
pub struct SysfsCoils {
    numbers: [u32; COIL_LINES],
    pins: [Pin; COIL_LINES],
    faults: u64,
}

impl SysfsCoils {
    /// Export each line and make it an output, driven low until the motor
    /// writes its first pattern.
    pub fn open(numbers: [u32; COIL_LINES]) -> anyhow::Result<Self> {
        let pins = numbers.map(|n| Pin::new(u64::from(n)));
        for (pin, n) in pins.iter().zip(numbers) {
            pin.export()
                .with_context(|| format!("failed to export GPIO {n}"))?;
            pin.set_direction(Direction::Low)
                .with_context(|| format!("failed to make GPIO {n} an output"))?;
        }
        info!(pins = ?numbers, "sysfs coil lines ready");
        Ok(SysfsCoils {
            numbers,
            pins,
            faults: 0,
        })
    }
}

impl CoilOutput for SysfsCoils {
    fn set_coils(&mut self, pattern: CoilPattern) {
        for ((pin, n), on) in self.pins.iter().zip(self.numbers).zip(pattern.lines()) {
            if let Err(e) = pin.set_value(u8::from(on)) {
                self.faults += 1;
                warn!(pin = n, error = %e, faults = self.faults, "failed to drive coil line");
            }
        }
        trace!(coils = %pattern, "set coils");
    }
}

/// The coil output selected by configuration.
pub enum Coils {
    Log(LogCoils),
    Sysfs(SysfsCoils),
}

impl Coils {
    pub fn from_settings(gpio: &GpioSettings, pins: [u32; COIL_LINES]) -> anyhow::Result<Self> {
        match gpio.backend {
            GpioBackend::Log => {
                info!(?pins, "coil lines are logged only (dry run)");
                Ok(Coils::Log(LogCoils::default()))
            }
            GpioBackend::Sysfs => SysfsCoils::open(pins).map(Coils::Sysfs),
        }
    }
}

impl CoilOutput for Coils {
    fn set_coils(&mut self, pattern: CoilPattern) {
        match self {
            Coils::Log(coils) => coils.set_coils(pattern),
            Coils::Sysfs(coils) => coils.set_coils(pattern),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PINS: [u32; 4] = [12, 14, 27, 26];

    #[test]
    fn test_log_coils_remember_last_pattern() {
        let mut coils = LogCoils::default();
        assert_eq!(coils.last(), None);
        coils.set_coils(CoilPattern::from_bits(0b0011));
        coils.set_coils(CoilPattern::from_bits(0b0110));
        assert_eq!(coils.last(), Some(CoilPattern::from_bits(0b0110)));
        assert_eq!(coils.writes(), 2);
    }

    #[test]
    fn test_log_backend_is_the_default() {
        let settings = GpioSettings::default();
        assert!(matches!(Coils::from_settings(&settings, PINS), Ok(Coils::Log(_))));
    }

    #[test]
    fn test_dispatches_to_selected_backend() {
        let mut coils = Coils::Log(LogCoils::default());
        coils.set_coils(CoilPattern::from_bits(0b1001));
        let Coils::Log(log) = &coils else {
            panic!("expected the log backend");
        };
        assert_eq!(log.last(), Some(CoilPattern::from_bits(0b1001)));
    }

    #[test]
    fn test_sysfs_open_reports_unusable_line() {
        // No GPIO controller has a line this high.
        let bogus = [4_000_000, 4_000_001, 4_000_002, 4_000_003];
        let settings = GpioSettings {
            backend: GpioBackend::Sysfs,
        };
        let err = Coils::from_settings(&settings, bogus).err().expect("open must fail");
        assert!(err.to_string().contains("GPIO 4000000"));
    }
}

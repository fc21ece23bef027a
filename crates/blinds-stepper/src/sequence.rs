//! Coil energization sequences for a 4-phase unipolar stepper.
//!
//! Each table entry is one phase of the repeating sequence. Walking the table
//! forwards turns the rotor one way, walking it backwards turns it the other.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of coil lines driven by the sequencer (IN1..IN4).
pub const COIL_LINES: usize = 4;

/// A 4-bit coil energization pattern.
///
/// Bit 0 is line IN1, bit 3 is line IN4. A set bit means the line is energized.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CoilPattern(u8);

impl CoilPattern {
    /// All coils released.
    pub const OFF: CoilPattern = CoilPattern(0);

    /// Build a pattern from its raw bits. Bits above the fourth are discarded.
    pub const fn from_bits(bits: u8) -> Self {
        CoilPattern(bits & 0b1111)
    }

    /// Raw 4-bit value.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether line `index` (0-based, 0 = IN1) is energized.
    /// Indices past the last line read as released.
    pub const fn line(self, index: usize) -> bool {
        index < COIL_LINES && (self.0 >> index) & 1 == 1
    }

    /// Per-line states, IN1 first.
    pub const fn lines(self) -> [bool; COIL_LINES] {
        [self.line(0), self.line(1), self.line(2), self.line(3)]
    }

    /// Number of energized lines.
    pub const fn energized(self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Display for CoilPattern {
    /// Renders the lines as `IN1 IN2 IN3 IN4`, e.g. `1100`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for on in self.lines() {
            f.write_str(if on { "1" } else { "0" })?;
        }
        Ok(())
    }
}

const IN1: u8 = 0b0001;
const IN2: u8 = 0b0010;
const IN3: u8 = 0b0100;
const IN4: u8 = 0b1000;

const FULL_STEP: [CoilPattern; 4] = [
    CoilPattern(IN1 | IN2),
    CoilPattern(IN2 | IN3),
    CoilPattern(IN3 | IN4),
    CoilPattern(IN4 | IN1),
];

const HALF_STEP: [CoilPattern; 8] = [
    CoilPattern(IN1),
    CoilPattern(IN1 | IN2),
    CoilPattern(IN2),
    CoilPattern(IN2 | IN3),
    CoilPattern(IN3),
    CoilPattern(IN3 | IN4),
    CoilPattern(IN4),
    CoilPattern(IN4 | IN1),
];

const WAVE_STEP: [CoilPattern; 4] = [
    CoilPattern(IN1),
    CoilPattern(IN2),
    CoilPattern(IN3),
    CoilPattern(IN4),
];

/// Stepping mode, selecting which coil sequence is walked.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Two adjacent coils on at every phase. Highest torque, 4 phases.
    Full,
    /// Alternates between one and two coils. Finest resolution, 8 phases.
    #[default]
    Half,
    /// One coil on at a time. Lowest power draw, 4 phases.
    Wave,
}

impl StepMode {
    /// The coil sequence for this mode.
    pub const fn sequence(self) -> &'static [CoilPattern] {
        match self {
            StepMode::Full => &FULL_STEP,
            StepMode::Half => &HALF_STEP,
            StepMode::Wave => &WAVE_STEP,
        }
    }

    /// Number of phases `N` in one electrical cycle.
    pub const fn phases(self) -> usize {
        self.sequence().len()
    }
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepMode::Full => "full",
            StepMode::Half => "half",
            StepMode::Wave => "wave",
        };
        f.write_str(name)
    }
}

/// Coil pattern for `phase` in the given mode.
///
/// The lookup is total: a phase outside `[0, N)` is reduced modulo `N`.
pub const fn pattern(mode: StepMode, phase: usize) -> CoilPattern {
    let sequence = mode.sequence();
    sequence[phase % sequence.len()]
}

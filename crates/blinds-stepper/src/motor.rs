//! Non-blocking positioning state machine.
//!
//! [`StepperMotor`] never sleeps. The caller invokes
//! [`advance_if_due`](StepperMotor::advance_if_due) as often as it likes and the
//! motor takes at most one phase step per call, only once the configured step
//! interval has elapsed since the previous step.

use core::fmt;
use core::time::Duration;

use crate::output::CoilOutput;
use crate::sequence::{CoilPattern, StepMode, pattern};

/// Direction of a single phase step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher step counts.
    Forward,
    /// Towards lower step counts.
    Backward,
}

impl Direction {
    /// Signed step delta, `+1` or `-1`.
    pub const fn delta(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Outcome of a successful phase advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Which way the rotor moved.
    pub direction: Direction,
    /// Position after the step.
    pub position: i32,
    /// Phase index after the step.
    pub phase: usize,
    /// Pattern written to the coils.
    pub pattern: CoilPattern,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} to {} (phase {}, coils {})",
            self.direction, self.position, self.phase, self.pattern
        )
    }
}

/// A single 4-phase stepper tracking an absolute target.
///
/// The motor starts at the reference pose: current and target position 0,
/// phase 0, last step at time zero. Timestamps are offsets from whatever
/// monotonic origin the caller uses, as long as it uses the same one every time.
pub struct StepperMotor<O> {
    output: O,
    mode: StepMode,
    step_interval: Duration,
    current_position: i32,
    target_position: i32,
    phase: usize,
    last_step_time: Duration,
}

impl<O: CoilOutput> StepperMotor<O> {
    /// Construct a motor and energize the coils for phase 0.
    ///
    /// # Arguments
    ///
    /// * `output`: Sink for coil patterns.
    /// * `mode`: Coil sequence to walk.
    /// * `step_interval`: Minimum time between two phase advances.
    pub fn new(mut output: O, mode: StepMode, step_interval: Duration) -> Self {
        output.set_coils(pattern(mode, 0));
        StepperMotor {
            output,
            mode,
            step_interval,
            current_position: 0,
            target_position: 0,
            phase: 0,
            last_step_time: Duration::ZERO,
        }
    }

    /// Overwrite the target position. Takes effect on the next advance.
    pub fn set_target_pos(&mut self, target: i32) {
        self.target_position = target;
    }

    /// Take one phase step towards the target if one is due.
    ///
    /// Returns `None` when the motor is already at its target (the last pattern
    /// stays asserted and is not re-driven) or when less than the step interval
    /// has elapsed since the previous step.
    pub fn advance_if_due(&mut self, now: Duration) -> Option<Step> {
        if self.current_position == self.target_position {
            return None;
        }
        if now.saturating_sub(self.last_step_time) < self.step_interval {
            return None;
        }

        let direction = if self.target_position > self.current_position {
            Direction::Forward
        } else {
            Direction::Backward
        };

        let n = self.mode.phases();
        self.phase = match direction {
            Direction::Forward => (self.phase + 1) % n,
            Direction::Backward => (self.phase + n - 1) % n,
        };
        self.current_position += direction.delta();
        self.last_step_time = now;

        let pattern = pattern(self.mode, self.phase);
        self.output.set_coils(pattern);

        Some(Step {
            direction,
            position: self.current_position,
            phase: self.phase,
            pattern,
        })
    }

    /// Current absolute position in steps.
    pub fn current_position(&self) -> i32 {
        self.current_position
    }

    /// Target absolute position in steps.
    pub fn target_position(&self) -> i32 {
        self.target_position
    }

    /// Signed number of steps left to the target.
    pub fn distance_to_go(&self) -> i64 {
        i64::from(self.target_position) - i64::from(self.current_position)
    }

    /// Whether the motor is holding at its target.
    pub fn is_at_target(&self) -> bool {
        self.current_position == self.target_position
    }

    /// Current index into the coil sequence, in `[0, N)`.
    pub fn phase_index(&self) -> usize {
        self.phase
    }

    /// Pattern currently asserted on the coils.
    pub fn coil_pattern(&self) -> CoilPattern {
        pattern(self.mode, self.phase)
    }

    /// The stepping mode.
    pub fn step_mode(&self) -> StepMode {
        self.mode
    }

    /// Minimum time between two phase advances.
    pub fn step_interval(&self) -> Duration {
        self.step_interval
    }

    /// Timestamp of the last phase advance.
    pub fn last_step_time(&self) -> Duration {
        self.last_step_time
    }

    /// The coil output.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutable access to the coil output.
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

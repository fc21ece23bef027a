use std::time::{Duration, Instant};

use blinds_stepper::{ByteOrder, CoilOutput, StepperMotor, dispatch};
use spin_sleep::SpinSleeper;
use tracing::{debug, info, trace, warn};

use crate::network::CommandChannel;
use crate::update::UpdateService;

/// Monotonic time source for the scheduler.
pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Wall-clock-independent clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub iterations: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub steps: u64,
}

/// Single-threaded cooperative loop.
///
/// Every iteration polls the update service, then the command channel, then
/// gives the motor its chance to step. A frame received in an iteration is
/// applied before that same iteration's advance.
pub struct Scheduler<U, N, O> {
    updates: U,
    commands: N,
    motor: StepperMotor<O>,
    byte_order: ByteOrder,
    stats: SchedulerStats,
}

impl<U, N, O> Scheduler<U, N, O>
where
    U: UpdateService,
    N: CommandChannel,
    O: CoilOutput,
{
    pub fn new(updates: U, commands: N, motor: StepperMotor<O>, byte_order: ByteOrder) -> Self {
        Scheduler {
            updates,
            commands,
            motor,
            byte_order,
            stats: SchedulerStats::default(),
        }
    }

    /// One loop iteration. Never blocks.
    pub fn tick(&mut self, now: Duration) {
        self.stats.iterations += 1;

        self.updates.poll();

        let Scheduler {
            commands,
            motor,
            byte_order,
            stats,
            ..
        } = self;
        let order = *byte_order;
        commands.poll(&mut |frame| match dispatch(frame, order, motor) {
            Ok(new_target) => {
                stats.frames_accepted += 1;
                debug!(
                    new_target,
                    position = motor.current_position(),
                    "new target position"
                );
            }
            Err(e) => {
                stats.frames_rejected += 1;
                warn!(error = %e, rejected = stats.frames_rejected, "discarding command frame");
            }
        });

        if let Some(step) = self.motor.advance_if_due(now) {
            self.stats.steps += 1;
            trace!(%step, "step");
            if self.motor.is_at_target() {
                info!(
                    position = step.position,
                    steps = self.stats.steps,
                    accepted = self.stats.frames_accepted,
                    rejected = self.stats.frames_rejected,
                    iterations = self.stats.iterations,
                    "target reached"
                );
            }
        }
    }

    /// Run forever, pausing `idle` between iterations.
    pub fn run(&mut self, clock: &impl Clock, idle: Duration) -> ! {
        let sleeper = SpinSleeper::new(10_000);
        info!(
            step_interval = ?self.motor.step_interval(),
            mode = %self.motor.step_mode(),
            ?idle,
            "scheduler loop running"
        );
        loop {
            self.tick(clock.now());
            if !idle.is_zero() {
                sleeper.sleep(idle);
            }
        }
    }

    #[cfg(test)]
    pub fn motor(&self) -> &StepperMotor<O> {
        &self.motor
    }

    #[cfg(test)]
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

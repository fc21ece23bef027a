mod config; // settings file + environment overrides
mod gpio; // coil line backends
mod link; // start-up network wait
mod network; // WebSocket command channel
mod scheduler; // cooperative main loop
mod update; // firmware image listener

use std::path::PathBuf;

use blinds_stepper::StepperMotor;
use tracing::info;
use tracing_subscriber::{self, EnvFilter};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::gpio::Coils;
use crate::network::WsCommandServer;
use crate::scheduler::{MonotonicClock, Scheduler};
use crate::update::{LogUpdateHandler, UpdateListener};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Blinds controller starting");

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let settings = crate::config::load_config(&path)?;

    // The motor holds phase 0 from here on; position 0 is wherever the blind
    // happens to be at power-up.
    let coils = Coils::from_settings(&settings.gpio, settings.motor.pins)?;
    let motor = StepperMotor::new(coils, settings.motor.step_mode, settings.motor.step_interval());

    let local = link::wait_for_link(&settings.link)?;
    info!(%local, "network ready");

    let updates = UpdateListener::bind(&settings.update, LogUpdateHandler::default())?;
    let commands = WsCommandServer::bind(settings.command.bind)?;

    let mut scheduler = Scheduler::new(updates, commands, motor, settings.command.byte_order);
    scheduler.run(&MonotonicClock::new(), settings.scheduler.idle())
}

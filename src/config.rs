use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use blinds_stepper::{ByteOrder, StepMode};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::{error, info};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const LOCAL_CONFIG_PATH: &str = "config/local.toml";
const ENV_PREFIX: &str = "BLINDS";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub motor: MotorSettings,
    #[serde(default)]
    pub gpio: GpioSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub update: UpdateSettings,
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// GPIO numbers of coil lines IN1..IN4.
    pub pins: [u32; 4],
    pub step_mode: StepMode,
    pub step_interval_us: u64,
}

impl MotorSettings {
    pub fn step_interval(&self) -> Duration {
        Duration::from_micros(self.step_interval_us)
    }
}

impl Default for MotorSettings {
    fn default() -> Self {
        MotorSettings {
            pins: [12, 14, 27, 26],
            step_mode: StepMode::Half,
            step_interval_us: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    /// Log patterns instead of touching hardware.
    #[default]
    Log,
    /// Linux sysfs GPIO.
    Sysfs,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpioSettings {
    pub backend: GpioBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub bind: SocketAddr,
    pub byte_order: ByteOrder,
}

impl Default for CommandSettings {
    fn default() -> Self {
        CommandSettings {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            byte_order: ByteOrder::BigEndian,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub bind: SocketAddr,
    /// Shared secret expected in every transfer header. `None` accepts any.
    pub password: Option<String>,
    pub staging_dir: PathBuf,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            bind: SocketAddr::from(([0, 0, 0, 0], 3232)),
            password: None,
            staging_dir: PathBuf::from("staging"),
        }
    }
}

// Keeps the password out of the logs.
impl fmt::Debug for UpdateSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSettings")
            .field("bind", &self.bind)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Address the host must have a route to before the controller starts.
    pub probe: SocketAddr,
    pub poll_ms: u64,
    /// Give up after this long. Absent means wait forever.
    pub timeout_ms: Option<u64>,
}

impl LinkSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            probe: SocketAddr::from(([8, 8, 8, 8], 53)),
            poll_ms: 500,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Pause between loop iterations. 0 disables it.
    pub idle_us: u64,
}

impl SchedulerSettings {
    pub fn idle(&self) -> Duration {
        Duration::from_micros(self.idle_us)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings { idle_us: 100 }
    }
}

impl Settings {
    fn from_config(config: Config) -> anyhow::Result<Self> {
        let settings: Settings = config
            .try_deserialize()
            .context("configuration does not match the expected layout")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.motor.step_interval_us == 0 {
            bail!("motor.step_interval_us must be positive");
        }
        if self.link.poll_ms == 0 {
            bail!("link.poll_ms must be positive");
        }
        if self.scheduler.idle_us >= self.motor.step_interval_us {
            bail!(
                "scheduler.idle_us ({}) must stay below motor.step_interval_us ({})",
                self.scheduler.idle_us,
                self.motor.step_interval_us
            );
        }
        Ok(())
    }
}

/// Load settings from `path`, then `config/local.toml` if present, then
/// `BLINDS__SECTION__KEY` environment variables.
pub fn load_config(path: &Path) -> anyhow::Result<Settings> {
    info!("Attempting to load configuration from {}", path.display());

    let config = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(true))
        .add_source(File::new(LOCAL_CONFIG_PATH, FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build();

    let settings = config
        .with_context(|| format!("failed to read {}", path.display()))
        .and_then(Settings::from_config);

    match settings {
        Ok(settings) => {
            info!("Successfully loaded configuration: {:?}", settings);
            Ok(settings)
        }
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
pub fn from_toml_str(toml: &str) -> anyhow::Result<Settings> {
    let config = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?;
    Settings::from_config(config)
}

//! Process configuration – reads `/etc/boardlink/config.toml`.
//!
//! Every field has a default, so an absent file starts the bridge with
//! stock parameters.  `BOARDLINK_*` environment variables override the
//! file for containerised deployments.

use std::path::Path;

use boardlink_types::BoardError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default location of the process configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/boardlink/config.toml";

/// What a session-ending failure does to the motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Zero current and target at teardown and push explicit zero-current
    /// frames through the link right away.
    #[default]
    Immediate,
    /// Zero the target only; the control loop ramps the motor down at the
    /// configured deceleration limit.
    Ramp,
}

/// Startup parameters for the bridge process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the websocket listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Serial device the controller is attached to.
    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// CAN id of the bus-addressed second controller.
    #[serde(default = "default_can_id")]
    pub can_id: u8,

    /// Control loop period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Telemetry request period in milliseconds while an operator is
    /// connected; `0` disables the poll (the push stream is authoritative).
    #[serde(default)]
    pub telemetry_poll_ms: u64,

    #[serde(default)]
    pub stop_mode: StopMode,

    /// Location of the persisted tunables.
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_can_id() -> u8 {
    124
}
fn default_tick_ms() -> u64 {
    10
}
fn default_settings_path() -> String {
    "/etc/boardlink/settings.toml".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            can_id: default_can_id(),
            tick_ms: default_tick_ms(),
            telemetry_poll_ms: 0,
            stop_mode: StopMode::default(),
            settings_path: default_settings_path(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn telemetry_poll(&self) -> Option<Duration> {
        (self.telemetry_poll_ms > 0).then(|| Duration::from_millis(self.telemetry_poll_ms))
    }
}

/// Resolve the config path from the command line.
///
/// Supports `boardlink <path>`, `boardlink --config <path>` and
/// `boardlink -c <path>`; defaults to [`DEFAULT_CONFIG_PATH`].
pub fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    parse_config_path_from(&args)
}

fn parse_config_path_from(args: &[String]) -> String {
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }
    DEFAULT_CONFIG_PATH.to_string()
}

/// Load the configuration from `path`.
///
/// A missing file yields the defaults; a present-but-malformed file is an
/// error, since silently ignoring a typo in a motor-control config is worse
/// than refusing to start.  Environment overrides apply in both cases.
pub fn load_from(path: impl AsRef<Path>) -> Result<Config, BoardError> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BoardError::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| BoardError::Config(format!("parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply `BOARDLINK_*` environment variable overrides to `config`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BOARDLINK_LISTEN_ADDR` | `listen_addr` |
/// | `BOARDLINK_SERIAL_PORT` | `serial_port` |
/// | `BOARDLINK_BAUD_RATE` | `baud_rate` |
/// | `BOARDLINK_CAN_ID` | `can_id` |
/// | `BOARDLINK_SETTINGS_PATH` | `settings_path` |
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("BOARDLINK_LISTEN_ADDR") {
        config.listen_addr = v;
    }
    if let Ok(v) = std::env::var("BOARDLINK_SERIAL_PORT") {
        config.serial_port = v;
    }
    if let Ok(v) = std::env::var("BOARDLINK_BAUD_RATE")
        && let Ok(baud) = v.parse::<u32>()
    {
        config.baud_rate = baud;
    }
    if let Ok(v) = std::env::var("BOARDLINK_CAN_ID")
        && let Ok(id) = v.parse::<u8>()
    {
        config.can_id = id;
    }
    if let Ok(v) = std::env::var("BOARDLINK_SETTINGS_PATH") {
        config.settings_path = v;
    }
}

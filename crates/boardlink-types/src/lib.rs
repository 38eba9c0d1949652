//! Shared data model for the boardlink stack.
//!
//! Everything that crosses a crate boundary lives here: the JSON envelope
//! exchanged with the remote operator, the persisted tunables, and the
//! crate-wide error enum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The tagged message exchanged with the remote client, in both directions.
///
/// `id` selects either a device message type (e.g. `"SetRPM"`) or a local
/// directive (e.g. `"SET_TARGET"`); `fields` carries the message payload as
/// a free-form JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Build an envelope from an id and a list of `(key, value)` fields.
    pub fn new(
        id: impl Into<String>,
        fields: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Self {
        Self {
            id: id.into(),
            fields: fields.into_iter().collect(),
        }
    }
}

/// Named numeric tunables governing the ramp controller.
///
/// Persisted to disk by the settings store and replaced wholesale via the
/// `SET_SETTINGS` directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum acceleration, in ERPM per second.
    #[serde(default = "default_accel")]
    pub accel_erpm_per_s: f64,

    /// Maximum deceleration, in ERPM per second.
    #[serde(default = "default_decel")]
    pub decel_erpm_per_s: f64,

    /// Clamp applied to every requested target, in ERPM.
    #[serde(default = "default_max_erpm")]
    pub max_erpm: f64,

    /// Magnitude below which the motor is commanded to an explicit stop
    /// instead of a near-zero velocity, in ERPM.
    #[serde(default = "default_deadband")]
    pub deadband_erpm: f64,
}

fn default_accel() -> f64 {
    5000.0
}
fn default_decel() -> f64 {
    5000.0
}
fn default_max_erpm() -> f64 {
    15000.0
}
fn default_deadband() -> f64 {
    100.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            accel_erpm_per_s: default_accel(),
            decel_erpm_per_s: default_decel(),
            max_erpm: default_max_erpm(),
            deadband_erpm: default_deadband(),
        }
    }
}

/// Global error type spanning the serial link, the wire codec, settings
/// persistence, and the websocket transport.
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("device link error: {0}")]
    Link(String),

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error("settings persistence error: {0}")]
    Settings(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("websocket transport error: {0}")]
    Transport(String),
}

//! `boardlink-core` – the session-independent heart of the bridge.
//!
//! # Modules
//!
//! - [`ramp`] – bounded-rate velocity controller driven by the control loop.
//! - [`gate`] – single-client session admission.
//! - [`router`] – two-tier dispatch of inbound client envelopes.
//! - [`relay`] – telemetry fan-out and the last-values cache.
//! - [`settings`] – persisted tunables.

pub mod gate;
pub mod ramp;
pub mod relay;
pub mod router;
pub mod settings;

pub use gate::{Session, SessionGate};
pub use ramp::{DriveCommand, RampController};
pub use relay::TelemetryRelay;
pub use router::{CommandRouter, Outcome};
pub use settings::SettingsStore;

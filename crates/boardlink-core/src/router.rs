//! Inbound command dispatch.
//!
//! Decoding runs in two tiers.  The envelope `id` is first resolved against
//! the typed device-message registry; a hit is encoded and written through
//! the link unchanged, without interpreting its semantics.  Otherwise the
//! `id` is matched against the local directives that drive the ramp
//! controller and the persisted settings.  Anything else is logged and
//! dropped, since a malformed message must never end the session.

use std::sync::{Arc, Mutex};

use boardlink_types::{Envelope, Settings};
use boardlink_vesc::codec::DeviceMessage;
use boardlink_vesc::link::DeviceLink;
use tracing::{info, warn};

use crate::ramp::RampController;
use crate::relay::TelemetryRelay;
use crate::settings::SettingsStore;

const SET_TARGET: &str = "SET_TARGET";
const GET_TARGET: &str = "GET_TARGET";
const SET_SETTINGS: &str = "SET_SETTINGS";
const GET_SETTINGS: &str = "GET_SETTINGS";

/// How one envelope was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Pass-through device command, written to the link.
    Forwarded,
    /// Local directive that mutated state.
    Applied,
    /// Local directive answered with a reply envelope.
    Replied,
    /// `id` matched neither tier; the message was dropped.
    Unknown,
    /// Recognised message with missing or mistyped fields; dropped.
    Invalid,
}

/// Routes client envelopes to the device link or the local directives.
pub struct CommandRouter {
    link: Arc<dyn DeviceLink>,
    ramp: Arc<Mutex<RampController>>,
    settings: Arc<Mutex<SettingsStore>>,
    relay: Arc<TelemetryRelay>,
    can_id: u8,
}

impl CommandRouter {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        ramp: Arc<Mutex<RampController>>,
        settings: Arc<Mutex<SettingsStore>>,
        relay: Arc<TelemetryRelay>,
        can_id: u8,
    ) -> Self {
        Self {
            link,
            ramp,
            settings,
            relay,
            can_id,
        }
    }

    /// Dispatch one envelope.  Never fails the session: every outcome,
    /// including unknown ids and bad fields, leaves the caller free to
    /// process the next message.
    pub async fn route(&self, envelope: Envelope) -> Outcome {
        match DeviceMessage::from_envelope(&envelope.id, &envelope.fields) {
            Ok(Some(message)) => {
                self.forward(message).await;
                return Outcome::Forwarded;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(id = %envelope.id, error = %e, "dropping device command with bad fields");
                return Outcome::Invalid;
            }
        }

        match envelope.id.as_str() {
            SET_TARGET => self.set_target(&envelope),
            GET_TARGET => self.get_target(),
            SET_SETTINGS => self.set_settings(&envelope),
            GET_SETTINGS => self.get_settings(),
            other => {
                warn!(id = other, "dropping unknown command");
                Outcome::Unknown
            }
        }
    }

    /// Write a pass-through command both plain and CAN-forwarded, matching
    /// the dual-controller addressing used everywhere else on the link.
    async fn forward(&self, message: DeviceMessage) {
        for frame in [message.encode(), message.encode_forwarded(self.can_id)] {
            if let Err(e) = self.link.send(frame).await {
                warn!(error = %e, "device write failed");
            }
        }
    }

    fn set_target(&self, envelope: &Envelope) -> Outcome {
        let Some(rpm) = envelope.fields.get("rpm").and_then(serde_json::Value::as_f64)
        else {
            warn!("SET_TARGET missing numeric `rpm` field, dropped");
            return Outcome::Invalid;
        };
        let mut ramp = self.ramp.lock().unwrap_or_else(|e| e.into_inner());
        ramp.set_target(rpm);
        info!(rpm = ramp.target(), "target velocity set");
        Outcome::Applied
    }

    fn get_target(&self) -> Outcome {
        let target = {
            let ramp = self.ramp.lock().unwrap_or_else(|e| e.into_inner());
            ramp.target()
        };
        let mut fields = serde_json::Map::new();
        fields.insert("rpm".to_string(), serde_json::json!(target));
        if let Some(measured) = self
            .relay
            .last_values()
            .and_then(|values| values.fields.get("rpm").cloned())
        {
            fields.insert("measured_rpm".to_string(), measured);
        }
        self.reply(Envelope {
            id: GET_TARGET.to_string(),
            fields,
        })
    }

    fn set_settings(&self, envelope: &Envelope) -> Outcome {
        let value = serde_json::Value::Object(envelope.fields.clone());
        let new: Settings = match serde_json::from_value(value) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "SET_SETTINGS with bad fields, dropped");
                return Outcome::Invalid;
            }
        };

        {
            let mut store = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = store.replace(new.clone()) {
                // The in-memory settings still apply; persistence catches up
                // on the next successful save.
                warn!(error = %e, "failed to persist settings");
            }
        }
        self.ramp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply_limits(&new);
        info!(?new, "settings replaced");

        self.reply(Envelope {
            id: SET_SETTINGS.to_string(),
            fields: settings_fields(&new),
        })
    }

    fn get_settings(&self) -> Outcome {
        let current = {
            let store = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            store.current().clone()
        };
        self.reply(Envelope {
            id: GET_SETTINGS.to_string(),
            fields: settings_fields(&current),
        })
    }

    fn reply(&self, envelope: Envelope) -> Outcome {
        // Replies share the telemetry stream so the websocket keeps a single
        // writer; a send error means the session vanished mid-route.
        let _ = self.relay.publisher().send(envelope);
        Outcome::Replied
    }
}

fn settings_fields(settings: &Settings) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(settings) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_vesc::codec::{Frame, Values};
    use boardlink_vesc::mock::MockLink;

    struct Fixture {
        router: CommandRouter,
        link: Arc<MockLink>,
        ramp: Arc<Mutex<RampController>>,
        relay: Arc<TelemetryRelay>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tmp dir");
        let link = Arc::new(MockLink::new());
        let ramp = Arc::new(Mutex::new(RampController::new(&Settings::default())));
        let settings = Arc::new(Mutex::new(SettingsStore::load(
            dir.path().join("settings.toml"),
        )));
        let relay = Arc::new(TelemetryRelay::default());
        let router = CommandRouter::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&ramp),
            Arc::clone(&settings),
            Arc::clone(&relay),
            124,
        );
        Fixture {
            router,
            link,
            ramp,
            relay,
            _dir: dir,
        }
    }

    fn envelope(id: &str, fields: serde_json::Value) -> Envelope {
        match fields {
            serde_json::Value::Object(map) => Envelope {
                id: id.to_string(),
                fields: map,
            },
            _ => panic!("fields must be an object"),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_dropped_and_session_continues() {
        let fx = fixture();
        let outcome = fx.router.route(envelope("WarpDrive", serde_json::json!({}))).await;
        assert_eq!(outcome, Outcome::Unknown);

        // The next message still routes normally.
        let outcome = fx
            .router
            .route(envelope("SET_TARGET", serde_json::json!({"rpm": 1000})))
            .await;
        assert_eq!(outcome, Outcome::Applied);
    }

    #[tokio::test]
    async fn set_target_mutates_the_ramp() {
        let fx = fixture();
        let outcome = fx
            .router
            .route(envelope("SET_TARGET", serde_json::json!({"rpm": 5000})))
            .await;
        assert_eq!(outcome, Outcome::Applied);
        let ramp = fx.ramp.lock().unwrap();
        assert_eq!(ramp.target(), 5000.0);
    }

    #[tokio::test]
    async fn set_target_without_rpm_is_invalid() {
        let fx = fixture();
        let outcome = fx
            .router
            .route(envelope("SET_TARGET", serde_json::json!({"speed": 5})))
            .await;
        assert_eq!(outcome, Outcome::Invalid);
        assert_eq!(fx.ramp.lock().unwrap().target(), 0.0);
    }

    #[tokio::test]
    async fn get_target_replies_with_target_and_measurement() {
        let fx = fixture();
        let mut rx = fx.relay.subscribe();
        fx.relay.on_frame(Frame::Values(Values {
            rpm: 4321,
            ..Values::default()
        }));
        fx.router
            .route(envelope("SET_TARGET", serde_json::json!({"rpm": 5000})))
            .await;

        let outcome = fx.router.route(envelope("GET_TARGET", serde_json::json!({}))).await;
        assert_eq!(outcome, Outcome::Replied);

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, "GET_TARGET");
        assert_eq!(reply.fields["rpm"], serde_json::json!(5000.0));
        assert_eq!(reply.fields["measured_rpm"], serde_json::json!(4321));
    }

    #[tokio::test]
    async fn device_command_is_forwarded_twice() {
        let fx = fixture();
        let outcome = fx
            .router
            .route(envelope("SetRPM", serde_json::json!({"rpm": 1000})))
            .await;
        assert_eq!(outcome, Outcome::Forwarded);

        let sent = fx.link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], DeviceMessage::SetRpm(1000).encode());
        assert_eq!(sent[1], DeviceMessage::SetRpm(1000).encode_forwarded(124));
    }

    #[tokio::test]
    async fn device_command_with_bad_fields_sends_nothing() {
        let fx = fixture();
        let outcome = fx
            .router
            .route(envelope("SetRPM", serde_json::json!({"rpm": "fast"})))
            .await;
        assert_eq!(outcome, Outcome::Invalid);
        assert!(fx.link.sent().is_empty());
    }

    #[tokio::test]
    async fn set_settings_applies_persists_and_echoes() {
        let fx = fixture();
        let mut rx = fx.relay.subscribe();
        let outcome = fx
            .router
            .route(envelope(
                "SET_SETTINGS",
                serde_json::json!({
                    "accel_erpm_per_s": 2000.0,
                    "decel_erpm_per_s": 8000.0,
                    "max_erpm": 6000.0,
                    "deadband_erpm": 50.0
                }),
            ))
            .await;
        assert_eq!(outcome, Outcome::Replied);

        let echo = rx.recv().await.unwrap();
        assert_eq!(echo.id, "SET_SETTINGS");
        assert_eq!(echo.fields["max_erpm"], serde_json::json!(6000.0));

        // The ramp picked the new clamp up.
        fx.router
            .route(envelope("SET_TARGET", serde_json::json!({"rpm": 9999})))
            .await;
        assert_eq!(fx.ramp.lock().unwrap().target(), 6000.0);
    }

    #[tokio::test]
    async fn get_settings_echoes_current_values() {
        let fx = fixture();
        let mut rx = fx.relay.subscribe();
        let outcome = fx
            .router
            .route(envelope("GET_SETTINGS", serde_json::json!({})))
            .await;
        assert_eq!(outcome, Outcome::Replied);

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, "GET_SETTINGS");
        assert_eq!(
            reply.fields["accel_erpm_per_s"],
            serde_json::json!(Settings::default().accel_erpm_per_s)
        );
    }
}

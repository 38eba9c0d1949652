//! The fixed-tick control loop.
//!
//! Runs for the whole process lifetime, with or without an operator
//! connected: every tick advances the ramp controller by the measured
//! elapsed time and writes the resulting command to the link twice: once
//! for the directly-attached controller, once CAN-forwarded for the
//! bus-addressed one.  A failed write is logged and the next tick retries,
//! so an unplugged controller never takes the process down.
//!
//! On shutdown the loop's final act is an explicit zero-current stop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use boardlink_core::gate::SessionGate;
use boardlink_core::ramp::{DriveCommand, RampController};
use boardlink_vesc::codec::DeviceMessage;
use boardlink_vesc::link::DeviceLink;
use tokio::sync::watch;
use tokio::time::{Instant, interval};
use tracing::{info, warn};

pub struct ControlLoop {
    ramp: Arc<Mutex<RampController>>,
    link: Arc<dyn DeviceLink>,
    gate: Arc<SessionGate>,
    can_id: u8,
    tick: Duration,
    /// Compatibility telemetry poll; `None` leaves the push stream as the
    /// only telemetry source.
    poll: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(
        ramp: Arc<Mutex<RampController>>,
        link: Arc<dyn DeviceLink>,
        gate: Arc<SessionGate>,
        can_id: u8,
        tick: Duration,
        poll: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ramp,
            link,
            gate,
            can_id,
            tick,
            poll,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.tick);
        let mut last_tick = Instant::now();
        let mut last_poll = Instant::now();
        info!(tick_ms = self.tick.as_millis() as u64, "control loop running");

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    let elapsed = now.duration_since(last_tick);
                    last_tick = now;

                    let command = {
                        let mut ramp = self.ramp.lock().unwrap_or_else(|e| e.into_inner());
                        ramp.advance(elapsed)
                    };
                    self.send_drive(command).await;

                    if let Some(period) = self.poll
                        && self.gate.is_active()
                        && now.duration_since(last_poll) >= period
                    {
                        last_poll = now;
                        self.send_both(DeviceMessage::GetValues).await;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Stopped: leave the device commanded to zero as the last action.
        self.send_both(DeviceMessage::SetCurrent(0.0)).await;
        info!("control loop stopped");
    }

    async fn send_drive(&self, command: DriveCommand) {
        let message = match command {
            DriveCommand::Stop => DeviceMessage::SetCurrent(0.0),
            DriveCommand::Rpm(rpm) => DeviceMessage::SetRpm(rpm),
        };
        self.send_both(message).await;
    }

    async fn send_both(&self, message: DeviceMessage) {
        for frame in [message.encode(), message.encode_forwarded(self.can_id)] {
            if let Err(e) = self.link.send(frame).await {
                warn!(error = %e, "device write failed, retrying next tick");
            }
        }
    }
}

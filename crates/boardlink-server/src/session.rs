//! Per-connection session coordination.
//!
//! A new websocket is admitted through the [`SessionGate`]; refusals get a
//! plain-text notice and an immediate close, with no tasks started.  An
//! admitted session runs two cooperating tasks against the split socket
//! (inbound envelopes into the [`CommandRouter`], outbound telemetry from
//! the [`TelemetryRelay`]) and whichever ends first tears the other down.
//! Teardown always stops the motors, frees the session slot, and awaits
//! both tasks, so no flow outlives its session and a dropped connection can
//! never leave the motor running at a stale velocity.

use std::sync::{Arc, Mutex};

use boardlink_core::gate::{Session, SessionGate};
use boardlink_core::ramp::RampController;
use boardlink_core::relay::TelemetryRelay;
use boardlink_core::router::CommandRouter;
use boardlink_types::{BoardError, Envelope};
use boardlink_vesc::codec::DeviceMessage;
use boardlink_vesc::link::DeviceLink;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, info, warn};

use crate::config::StopMode;

/// Sent to a second concurrent client before its transport is closed.
pub const REJECT_NOTICE: &str = "Only one connection allowed at a time";

/// Composes gate, router and relay for each accepted connection.
pub struct SessionCoordinator {
    gate: Arc<SessionGate>,
    router: Arc<CommandRouter>,
    relay: Arc<TelemetryRelay>,
    ramp: Arc<Mutex<RampController>>,
    link: Arc<dyn DeviceLink>,
    can_id: u8,
    stop_mode: StopMode,
}

impl SessionCoordinator {
    pub fn new(
        gate: Arc<SessionGate>,
        router: Arc<CommandRouter>,
        relay: Arc<TelemetryRelay>,
        ramp: Arc<Mutex<RampController>>,
        link: Arc<dyn DeviceLink>,
        can_id: u8,
        stop_mode: StopMode,
    ) -> Self {
        Self {
            gate,
            router,
            relay,
            ramp,
            link,
            can_id,
            stop_mode,
        }
    }

    /// Drive one websocket connection from handshake to teardown.
    ///
    /// Returns `Ok` for every orderly outcome, including rejection and
    /// peer-initiated disconnects; only a failed handshake is an error.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), BoardError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ws = accept_async(stream)
            .await
            .map_err(|e| BoardError::Transport(format!("handshake: {e}")))?;

        let session = Session::new();
        if !self.gate.try_admit(&session) {
            warn!("refusing second concurrent connection");
            let _ = ws.send(Message::Text(REJECT_NOTICE.into())).await;
            let _ = ws.close(None).await;
            return Ok(());
        }
        info!("operator connected");

        let (ws_tx, ws_rx) = ws.split();
        let mut inbound = tokio::spawn(inbound_flow(ws_rx, Arc::clone(&self.router)));
        let mut outbound = tokio::spawn(outbound_flow(ws_tx, self.relay.subscribe()));

        // Whichever flow finishes first (end of stream, transport error or
        // cancellation) triggers teardown of the other.
        let inbound_finished = tokio::select! {
            _ = &mut inbound => true,
            _ = &mut outbound => false,
        };
        if inbound_finished {
            outbound.abort();
        } else {
            inbound.abort();
        }

        self.stop_motors().await;
        self.gate.release(&session);

        // Cancellation is the expected way for the survivor to end; await it
        // so no flow outlives the session.
        let _ = if inbound_finished {
            outbound.await
        } else {
            inbound.await
        };
        info!("operator disconnected, session slot free");
        Ok(())
    }

    /// Command the motors to a safe state after a session ends.
    pub async fn stop_motors(&self) {
        info!(mode = ?self.stop_mode, "stopping motors");
        {
            let mut ramp = self.ramp.lock().unwrap_or_else(|e| e.into_inner());
            match self.stop_mode {
                StopMode::Immediate => ramp.force_stop(),
                StopMode::Ramp => ramp.reset_target(),
            }
        }
        if self.stop_mode == StopMode::Immediate {
            let stop = DeviceMessage::SetCurrent(0.0);
            for frame in [stop.encode(), stop.encode_forwarded(self.can_id)] {
                if let Err(e) = self.link.send(frame).await {
                    warn!(error = %e, "stop command write failed");
                }
            }
        }
    }
}

/// Feed received envelopes into the router until the peer goes away.
///
/// End of stream and transport errors both end the flow without error;
/// closure is an expected outcome here, not a failure to propagate.
async fn inbound_flow<S>(mut ws_rx: SplitStream<WebSocketStream<S>>, router: Arc<CommandRouter>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                Ok(envelope) => {
                    router.route(envelope).await;
                }
                Err(e) => warn!(error = %e, "malformed envelope dropped"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    debug!("inbound flow ended");
}

/// Forward telemetry envelopes to the client until the transport closes.
async fn outbound_flow<S>(
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
    mut envelopes: broadcast::Receiver<Envelope>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match envelopes.recv().await {
            Ok(envelope) => {
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "unserialisable envelope skipped");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged_by = n, "telemetry subscriber lagged, frames skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("outbound flow ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_core::settings::SettingsStore;
    use boardlink_types::Settings;
    use boardlink_vesc::mock::MockLink;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::client_async;

    struct Fixture {
        coordinator: Arc<SessionCoordinator>,
        gate: Arc<SessionGate>,
        ramp: Arc<Mutex<RampController>>,
        relay: Arc<TelemetryRelay>,
        link: Arc<MockLink>,
        _dir: tempfile::TempDir,
    }

    fn fixture(stop_mode: StopMode) -> Fixture {
        let dir = tempfile::tempdir().expect("tmp dir");
        let link = Arc::new(MockLink::new());
        let gate = Arc::new(SessionGate::new());
        let ramp = Arc::new(Mutex::new(RampController::new(&Settings::default())));
        let settings = Arc::new(Mutex::new(SettingsStore::load(
            dir.path().join("settings.toml"),
        )));
        let relay = Arc::new(TelemetryRelay::default());
        let router = Arc::new(CommandRouter::new(
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            Arc::clone(&ramp),
            settings,
            Arc::clone(&relay),
            124,
        ));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&gate),
            router,
            Arc::clone(&relay),
            Arc::clone(&ramp),
            Arc::clone(&link) as Arc<dyn DeviceLink>,
            124,
            stop_mode,
        ));
        Fixture {
            coordinator,
            gate,
            ramp,
            relay,
            link,
            _dir: dir,
        }
    }

    type ClientWs = WebSocketStream<DuplexStream>;

    async fn connect(
        coordinator: &Arc<SessionCoordinator>,
    ) -> (ClientWs, tokio::task::JoinHandle<Result<(), BoardError>>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let coordinator = Arc::clone(coordinator);
        let server = tokio::spawn(async move { coordinator.handle_connection(server_io).await });
        let (ws, _) = client_async("ws://device.local/", client_io)
            .await
            .expect("client handshake");
        (ws, server)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn inbound_set_target_reaches_the_ramp() {
        let fx = fixture(StopMode::Immediate);
        let (mut ws, _server) = connect(&fx.coordinator).await;

        ws.send(Message::Text(
            r#"{"id":"SET_TARGET","fields":{"rpm":5000}}"#.into(),
        ))
        .await
        .expect("send");

        let ramp = Arc::clone(&fx.ramp);
        wait_until(move || ramp.lock().unwrap().target() == 5000.0).await;
    }

    #[tokio::test]
    async fn malformed_json_does_not_end_the_session() {
        let fx = fixture(StopMode::Immediate);
        let (mut ws, _server) = connect(&fx.coordinator).await;

        ws.send(Message::Text("{not json".into())).await.expect("send");
        ws.send(Message::Text(
            r#"{"id":"SET_TARGET","fields":{"rpm":1234}}"#.into(),
        ))
        .await
        .expect("send");

        let ramp = Arc::clone(&fx.ramp);
        wait_until(move || ramp.lock().unwrap().target() == 1234.0).await;
        assert!(fx.gate.is_active());
    }

    #[tokio::test]
    async fn telemetry_envelopes_reach_the_client() {
        let fx = fixture(StopMode::Immediate);
        let (mut ws, _server) = connect(&fx.coordinator).await;

        let publisher = fx.relay.publisher();
        wait_until(move || publisher.receiver_count() > 0).await;

        let envelope = Envelope::new(
            "GetValues",
            [("rpm".to_string(), serde_json::json!(2500))],
        );
        fx.relay.publisher().send(envelope.clone()).expect("publish");

        let message = ws.next().await.expect("stream open").expect("frame");
        match message {
            Message::Text(text) => {
                let received: Envelope = serde_json::from_str(text.as_str()).expect("parse");
                assert_eq!(received, envelope);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_client_is_rejected_and_first_keeps_working() {
        let fx = fixture(StopMode::Immediate);
        let (mut first, _server1) = connect(&fx.coordinator).await;

        let (mut second, server2) = connect(&fx.coordinator).await;
        let notice = second.next().await.expect("stream open").expect("frame");
        assert_eq!(notice, Message::Text(REJECT_NOTICE.into()));
        match second.next().await {
            None | Some(Ok(Message::Close(_))) => {}
            other => panic!("expected closure after the notice, got {other:?}"),
        }
        server2.await.expect("join").expect("rejection is orderly");

        // The active session never noticed.
        assert!(fx.gate.is_active());
        first
            .send(Message::Text(
                r#"{"id":"SET_TARGET","fields":{"rpm":3000}}"#.into(),
            ))
            .await
            .expect("send");
        let ramp = Arc::clone(&fx.ramp);
        wait_until(move || ramp.lock().unwrap().target() == 3000.0).await;
    }

    #[tokio::test]
    async fn disconnect_stops_motors_and_frees_the_slot() {
        let fx = fixture(StopMode::Immediate);
        let (mut ws, server) = connect(&fx.coordinator).await;

        ws.send(Message::Text(
            r#"{"id":"SET_TARGET","fields":{"rpm":5000}}"#.into(),
        ))
        .await
        .expect("send");
        let ramp = Arc::clone(&fx.ramp);
        wait_until(move || ramp.lock().unwrap().target() == 5000.0).await;

        ws.close(None).await.expect("close");
        server.await.expect("join").expect("orderly teardown");

        assert!(!fx.gate.is_active());
        assert_eq!(fx.ramp.lock().unwrap().target(), 0.0);
        assert_eq!(fx.ramp.lock().unwrap().current(), 0.0);
        let stop = DeviceMessage::SetCurrent(0.0);
        let sent = fx.link.sent();
        assert!(sent.contains(&stop.encode()));
        assert!(sent.contains(&stop.encode_forwarded(124)));

        // The slot is free for the next operator.
        let (_ws, _server) = connect(&fx.coordinator).await;
        wait_until({
            let gate = Arc::clone(&fx.gate);
            move || gate.is_active()
        })
        .await;
    }

    #[tokio::test]
    async fn ramp_stop_mode_only_resets_the_target() {
        let fx = fixture(StopMode::Ramp);
        let (mut ws, server) = connect(&fx.coordinator).await;

        ws.send(Message::Text(
            r#"{"id":"SET_TARGET","fields":{"rpm":5000}}"#.into(),
        ))
        .await
        .expect("send");
        let ramp = Arc::clone(&fx.ramp);
        wait_until(move || ramp.lock().unwrap().target() == 5000.0).await;
        // Pretend the loop already ramped partway up.
        fx.ramp.lock().unwrap().advance(Duration::from_millis(500));

        ws.close(None).await.expect("close");
        server.await.expect("join").expect("orderly teardown");

        assert_eq!(fx.ramp.lock().unwrap().target(), 0.0);
        assert!(fx.ramp.lock().unwrap().current() > 0.0);
        // No immediate stop frame; the control loop ramps down instead.
        assert!(fx.link.sent().is_empty());
    }
}

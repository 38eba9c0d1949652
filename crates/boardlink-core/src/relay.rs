//! Telemetry fan-out.
//!
//! Every decoded frame from the device link becomes one [`Envelope`] on a
//! [`tokio::sync::broadcast`] channel.  The session's outbound flow
//! subscribes while connected; with no subscriber the send fails and the
//! envelope is simply discarded; frames are always drained so a missing
//! client can never back-pressure the serial reader.
//!
//! The most recent `GetValues` envelope is additionally cached so local
//! directives can answer measurement queries synchronously.

use std::sync::RwLock;

use boardlink_types::Envelope;
use boardlink_vesc::codec::{FieldValue, Frame};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Buffered envelopes per subscriber before old ones are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// Converts device frames to client envelopes and fans them out.
pub struct TelemetryRelay {
    envelopes: broadcast::Sender<Envelope>,
    last_values: RwLock<Option<Envelope>>,
}

impl TelemetryRelay {
    pub fn new(capacity: usize) -> Self {
        let (envelopes, _) = broadcast::channel(capacity);
        Self {
            envelopes,
            last_values: RwLock::new(None),
        }
    }

    /// Subscribe to the live envelope stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Sender handle for components that inject envelopes of their own
    /// (command replies share the client's single outbound stream).
    pub fn publisher(&self) -> broadcast::Sender<Envelope> {
        self.envelopes.clone()
    }

    /// The most recent `GetValues` envelope, if any frame has arrived yet.
    pub fn last_values(&self) -> Option<Envelope> {
        self.last_values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Convert one frame to its envelope, caching `GetValues` frames.
    ///
    /// Raw-byte fields are rendered as big-endian unsigned integers.
    pub fn on_frame(&self, frame: Frame) -> Envelope {
        let fields = frame
            .fields()
            .into_iter()
            .map(|(name, value)| (name.to_string(), render(value)))
            .collect();
        let envelope = Envelope {
            id: frame.name().to_string(),
            fields,
        };
        if matches!(frame, Frame::Values(_)) {
            *self
                .last_values
                .write()
                .unwrap_or_else(|e| e.into_inner()) = Some(envelope.clone());
        }
        envelope
    }

    /// Drain the device frame stream for the life of the process,
    /// publishing every envelope in arrival order.
    pub async fn run(&self, mut frames: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            let envelope = self.on_frame(frame);
            // A send error just means nobody is connected right now.
            let _ = self.envelopes.send(envelope);
        }
        debug!("device frame stream ended");
    }
}

impl Default for TelemetryRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn render(value: FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Int(i) => serde_json::json!(i),
        FieldValue::Float(f) => serde_json::json!(f),
        FieldValue::Bytes(bytes) => {
            let n = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
            serde_json::json!(n)
        }
    }
}

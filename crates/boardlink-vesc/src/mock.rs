//! In-memory [`DeviceLink`] that records every frame instead of writing it
//! to hardware.  Used by unit tests across the workspace and handy for dry
//! runs without a controller attached.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use boardlink_types::BoardError;

use crate::link::DeviceLink;

/// Recording device link.
#[derive(Default)]
pub struct MockLink {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame sent so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop the recorded frames.
    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), BoardError> {
        if self.is_closed() {
            return Err(BoardError::Link("link closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoardError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

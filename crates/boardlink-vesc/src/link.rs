//! The [`DeviceLink`] seam and its serial-port implementation.
//!
//! The bridge never talks to hardware directly.  It writes pre-encoded
//! frames through the trait and consumes decoded [`Frame`]s from the
//! channel handed out at open time, so tests can substitute a
//! [`MockLink`][crate::mock::MockLink] without touching any routing or
//! control code.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use boardlink_types::BoardError;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{Frame, FrameDecoder};

/// Baud rate the controller ships with.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Read timeout on the serial port; bounds how long the reader thread can
/// sit blind to the shutdown flag.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Write side of the device boundary.
///
/// Implementations must tolerate concurrent callers: the control loop, the
/// command router, and session teardown all hold the same handle.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Queue one pre-encoded frame for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::Link`] only when the link has been closed; a
    /// transient transport failure is logged at the transport layer and
    /// does not surface here, so callers keep running against a controller
    /// that may come back.
    async fn send(&self, frame: Vec<u8>) -> Result<(), BoardError>;

    /// Drain pending writes, then release the transport.  Idempotent.
    async fn close(&self) -> Result<(), BoardError>;
}

enum WriteOp {
    Frame(Vec<u8>),
    Shutdown,
}

/// [`DeviceLink`] over a physical serial port.
///
/// One thread drains the write queue in submission order; another reads
/// raw bytes, feeds the [`FrameDecoder`], and pushes decoded frames into
/// the channel returned by [`SerialLink::open`].  That frame stream exists
/// once per open; it is not restartable mid-stream.
pub struct SerialLink {
    writes: mpsc::UnboundedSender<WriteOp>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl SerialLink {
    /// Open `path` at `baud` and start the reader/writer threads.
    ///
    /// Returns the link plus the decoded-frame stream the relay consumes.
    pub fn open(
        path: &str,
        baud: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Frame>), BoardError> {
        let writer_port = serialport::new(path, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| BoardError::Link(format!("open {path}: {e}")))?;
        let reader_port = writer_port
            .try_clone()
            .map_err(|e| BoardError::Link(format!("clone {path}: {e}")))?;

        info!(port = path, baud, "serial link open");

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let reader_stop = Arc::clone(&stop);
        let writer = std::thread::Builder::new()
            .name("link-writer".to_string())
            .spawn(move || writer_loop(writer_port, writes_rx))
            .map_err(|e| BoardError::Link(format!("spawn writer: {e}")))?;
        let reader = std::thread::Builder::new()
            .name("link-reader".to_string())
            .spawn(move || reader_loop(reader_port, frames_tx, reader_stop))
            .map_err(|e| BoardError::Link(format!("spawn reader: {e}")))?;

        let link = Self {
            writes: writes_tx,
            stop,
            threads: Mutex::new(Some((writer, reader))),
        };
        Ok((link, frames_rx))
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), BoardError> {
        self.writes
            .send(WriteOp::Frame(frame))
            .map_err(|_| BoardError::Link("link closed".to_string()))
    }

    async fn close(&self) -> Result<(), BoardError> {
        self.stop.store(true, Ordering::Relaxed);
        // Queued frames are written before the shutdown op is reached, so
        // pending writes drain.
        let _ = self.writes.send(WriteOp::Shutdown);

        let handles = {
            let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some((writer, reader)) = handles {
            tokio::task::spawn_blocking(move || {
                let _ = writer.join();
                let _ = reader.join();
            })
            .await
            .map_err(|e| BoardError::Link(format!("close join: {e}")))?;
            info!("serial link closed and flushed");
        }
        Ok(())
    }
}

fn writer_loop(mut port: Box<dyn SerialPort>, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = ops.blocking_recv() {
        match op {
            WriteOp::Frame(bytes) => {
                if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
                    warn!(error = %e, "serial write failed");
                }
            }
            WriteOp::Shutdown => break,
        }
    }
    let _ = port.flush();
    debug!("serial writer stopped");
}

fn reader_loop(
    mut port: Box<dyn SerialPort>,
    frames: mpsc::UnboundedSender<Frame>,
    stop: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                while let Some(frame) = decoder.next_frame() {
                    if frames.send(frame).is_err() {
                        // Consumer gone; nothing left to decode for.
                        debug!("frame consumer dropped, serial reader stopping");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!(error = %e, "serial read failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("serial reader stopped");
}

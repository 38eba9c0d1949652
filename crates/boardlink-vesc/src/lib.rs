//! `boardlink-vesc` – the device boundary.
//!
//! Speaks the VESC short-frame serial protocol and owns the physical
//! transport.  The rest of the stack only ever sees decoded [`Frame`]s
//! coming out and pre-encoded byte buffers going in through the
//! [`DeviceLink`] trait, so the hardware can be swapped for a
//! [`MockLink`] in tests without touching routing or control logic.
//!
//! # Modules
//!
//! - [`codec`] – frame encode/decode: CRC-16/XMODEM framing, the typed
//!   [`DeviceMessage`] registry, and the incremental [`FrameDecoder`].
//! - [`link`] – the [`DeviceLink`] trait and its [`SerialLink`]
//!   implementation over a real serial port.
//! - [`mock`] – an in-memory recording link for tests and dry runs.

pub mod codec;
pub mod link;
pub mod mock;

pub use codec::{DeviceMessage, FieldValue, Frame, FrameDecoder, RotorPosition, Values, Version};
pub use link::{DeviceLink, SerialLink};
pub use mock::MockLink;

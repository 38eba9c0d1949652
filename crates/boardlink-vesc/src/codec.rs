//! VESC short-frame wire codec.
//!
//! Frame layout: `[0x02, len, payload…, crc_hi, crc_lo, 0x03]` where the
//! CRC-16/XMODEM covers the payload only and the payload starts with a
//! command id byte followed by big-endian packed fields.
//!
//! Outbound commands are a closed set, [`DeviceMessage`]; the string names
//! clients use (`"SetRPM"`, `"GetValues"`, …) resolve through
//! [`DeviceMessage::from_envelope`].  Inbound telemetry decodes into
//! [`Frame`] via the incremental [`FrameDecoder`], which resynchronises on
//! garbage by skipping to the next plausible start byte.

use boardlink_types::BoardError;
use tracing::debug;

/// Frame start byte for payloads up to 255 bytes.
pub const START: u8 = 0x02;
/// Frame terminator byte.
pub const TERMINATOR: u8 = 0x03;

const COMM_FW_VERSION: u8 = 0;
const COMM_GET_VALUES: u8 = 4;
const COMM_SET_DUTY: u8 = 5;
const COMM_SET_CURRENT: u8 = 6;
const COMM_SET_CURRENT_BRAKE: u8 = 7;
const COMM_SET_RPM: u8 = 8;
const COMM_SET_ROTOR_POSITION_MODE: u8 = 21;
const COMM_GET_ROTOR_POSITION: u8 = 22;
const COMM_FORWARD_CAN: u8 = 34;

/// Longest payload any known frame carries; a length byte beyond this is a
/// false start byte, not a frame.
const MAX_PAYLOAD: usize = 64;

/// CRC-16/XMODEM (poly 0x1021, init 0), the checksum VESC frames carry.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let crc = crc16(payload);
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(START);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc.to_be_bytes());
    out.push(TERMINATOR);
    out
}

// ---------------------------------------------------------------------------
// Outbound command registry
// ---------------------------------------------------------------------------

/// A command the controller understands, constructed either locally (the
/// control loop) or from a client envelope (pass-through routing).
///
/// The name-to-constructor mapping is a closed match table; there is no
/// runtime registration.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Set electrical RPM.
    SetRpm(i32),
    /// Set motor current in amps.  `SetCurrent(0.0)` is the explicit stop.
    SetCurrent(f64),
    /// Set braking current in amps.
    SetCurrentBrake(f64),
    /// Set duty cycle, -1.0..=1.0.
    SetDuty(f64),
    /// Select how the rotor position is reported.
    SetRotorPositionMode(u8),
    /// Request a `Values` telemetry frame.
    GetValues,
    /// Request a `RotorPosition` telemetry frame.
    GetRotorPosition,
    /// Request a `Version` frame.
    GetVersion,
}

fn number_field(
    fields: &serde_json::Map<String, serde_json::Value>,
    id: &str,
    key: &str,
) -> Result<f64, BoardError> {
    fields
        .get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| BoardError::Codec(format!("{id}: missing or non-numeric field `{key}`")))
}

impl DeviceMessage {
    /// Resolve a client envelope against the command registry.
    ///
    /// Returns `Ok(None)` when `id` names no device message at all (the
    /// caller falls through to local directives), and `Err` when the name
    /// resolved but the fields are missing or mistyped.
    pub fn from_envelope(
        id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Self>, BoardError> {
        let msg = match id {
            "SetRPM" => Self::SetRpm(number_field(fields, id, "rpm")? as i32),
            "SetCurrent" => Self::SetCurrent(number_field(fields, id, "current")?),
            "SetCurrentBrake" => Self::SetCurrentBrake(number_field(fields, id, "current")?),
            "SetDuty" => Self::SetDuty(number_field(fields, id, "duty")?),
            "SetRotorPositionMode" => {
                Self::SetRotorPositionMode(number_field(fields, id, "mode")? as u8)
            }
            "GetValues" => Self::GetValues,
            "GetRotorPosition" => Self::GetRotorPosition,
            "GetVersion" => Self::GetVersion,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn payload(&self) -> Vec<u8> {
        match *self {
            Self::SetRpm(rpm) => {
                let mut p = vec![COMM_SET_RPM];
                p.extend_from_slice(&rpm.to_be_bytes());
                p
            }
            Self::SetCurrent(amps) => {
                let mut p = vec![COMM_SET_CURRENT];
                p.extend_from_slice(&((amps * 1000.0) as i32).to_be_bytes());
                p
            }
            Self::SetCurrentBrake(amps) => {
                let mut p = vec![COMM_SET_CURRENT_BRAKE];
                p.extend_from_slice(&((amps * 1000.0) as i32).to_be_bytes());
                p
            }
            Self::SetDuty(duty) => {
                let mut p = vec![COMM_SET_DUTY];
                p.extend_from_slice(&((duty * 100_000.0) as i32).to_be_bytes());
                p
            }
            Self::SetRotorPositionMode(mode) => vec![COMM_SET_ROTOR_POSITION_MODE, mode],
            Self::GetValues => vec![COMM_GET_VALUES],
            Self::GetRotorPosition => vec![COMM_GET_ROTOR_POSITION],
            Self::GetVersion => vec![COMM_FW_VERSION],
        }
    }

    /// Encode as a complete frame addressed to the directly-attached
    /// controller.
    pub fn encode(&self) -> Vec<u8> {
        frame(&self.payload())
    }

    /// Encode wrapped in CAN forwarding so a bus-addressed controller behind
    /// the attached one executes it.
    pub fn encode_forwarded(&self, can_id: u8) -> Vec<u8> {
        let inner = self.payload();
        let mut p = Vec::with_capacity(inner.len() + 2);
        p.push(COMM_FORWARD_CAN);
        p.push(can_id);
        p.extend_from_slice(&inner);
        frame(&p)
    }
}

// ---------------------------------------------------------------------------
// Inbound telemetry frames
// ---------------------------------------------------------------------------

/// A field value as it appears on the wire, before JSON rendering.
///
/// Raw-byte fields stay raw here; the relay renders them as big-endian
/// unsigned integers at the envelope boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Full measurement snapshot reported by the controller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Values {
    pub temp_fet: f64,
    pub temp_motor: f64,
    pub motor_current: f64,
    pub input_current: f64,
    pub duty_cycle: f64,
    pub rpm: i32,
    pub input_voltage: f64,
    pub amp_hours: f64,
    pub amp_hours_charged: f64,
    pub watt_hours: f64,
    pub watt_hours_charged: f64,
    pub tachometer: i32,
    pub tachometer_abs: i32,
    pub fault_code: u8,
    pub controller_id: Vec<u8>,
}

/// Firmware version report.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// Rotor position report in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct RotorPosition {
    pub degrees: f64,
}

/// A decoded telemetry frame from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Values(Values),
    Version(Version),
    RotorPosition(RotorPosition),
}

impl Frame {
    /// The type name used as the envelope `id` when relayed to a client.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Values(_) => "GetValues",
            Self::Version(_) => "GetVersion",
            Self::RotorPosition(_) => "GetRotorPosition",
        }
    }

    /// The frame's fields in wire order.
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        match self {
            Self::Values(v) => vec![
                ("temp_fet", FieldValue::Float(v.temp_fet)),
                ("temp_motor", FieldValue::Float(v.temp_motor)),
                ("motor_current", FieldValue::Float(v.motor_current)),
                ("input_current", FieldValue::Float(v.input_current)),
                ("duty_cycle", FieldValue::Float(v.duty_cycle)),
                ("rpm", FieldValue::Int(v.rpm as i64)),
                ("input_voltage", FieldValue::Float(v.input_voltage)),
                ("amp_hours", FieldValue::Float(v.amp_hours)),
                ("amp_hours_charged", FieldValue::Float(v.amp_hours_charged)),
                ("watt_hours", FieldValue::Float(v.watt_hours)),
                ("watt_hours_charged", FieldValue::Float(v.watt_hours_charged)),
                ("tachometer", FieldValue::Int(v.tachometer as i64)),
                ("tachometer_abs", FieldValue::Int(v.tachometer_abs as i64)),
                ("fault_code", FieldValue::Int(v.fault_code as i64)),
                ("controller_id", FieldValue::Bytes(v.controller_id.clone())),
            ],
            Self::Version(v) => vec![
                ("major", FieldValue::Int(v.major as i64)),
                ("minor", FieldValue::Int(v.minor as i64)),
            ],
            Self::RotorPosition(p) => vec![("degrees", FieldValue::Float(p.degrees))],
        }
    }

    /// Encode as a complete frame, exactly as the controller would emit it.
    ///
    /// Used by mock devices and tests; the bridge itself never encodes
    /// telemetry.
    pub fn encode(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Self::Values(v) => {
                p.push(COMM_GET_VALUES);
                p.extend_from_slice(&((v.temp_fet * 10.0) as i16).to_be_bytes());
                p.extend_from_slice(&((v.temp_motor * 10.0) as i16).to_be_bytes());
                p.extend_from_slice(&((v.motor_current * 100.0) as i32).to_be_bytes());
                p.extend_from_slice(&((v.input_current * 100.0) as i32).to_be_bytes());
                p.extend_from_slice(&((v.duty_cycle * 1000.0) as i16).to_be_bytes());
                p.extend_from_slice(&v.rpm.to_be_bytes());
                p.extend_from_slice(&((v.input_voltage * 10.0) as i16).to_be_bytes());
                p.extend_from_slice(&((v.amp_hours * 10_000.0) as i32).to_be_bytes());
                p.extend_from_slice(&((v.amp_hours_charged * 10_000.0) as i32).to_be_bytes());
                p.extend_from_slice(&((v.watt_hours * 10_000.0) as i32).to_be_bytes());
                p.extend_from_slice(&((v.watt_hours_charged * 10_000.0) as i32).to_be_bytes());
                p.extend_from_slice(&v.tachometer.to_be_bytes());
                p.extend_from_slice(&v.tachometer_abs.to_be_bytes());
                p.push(v.fault_code);
                p.push(v.controller_id.first().copied().unwrap_or(0));
            }
            Self::Version(v) => {
                p.push(COMM_FW_VERSION);
                p.push(v.major);
                p.push(v.minor);
            }
            Self::RotorPosition(pos) => {
                p.push(COMM_GET_ROTOR_POSITION);
                p.extend_from_slice(&((pos.degrees * 100_000.0) as i32).to_be_bytes());
            }
        }
        frame(&p)
    }

    fn decode(payload: &[u8]) -> Result<Self, BoardError> {
        let (&id, rest) = payload
            .split_first()
            .ok_or_else(|| BoardError::Codec("empty payload".to_string()))?;
        let mut r = Reader::new(rest);
        match id {
            COMM_GET_VALUES => {
                let values = Values {
                    temp_fet: r.i16()? as f64 / 10.0,
                    temp_motor: r.i16()? as f64 / 10.0,
                    motor_current: r.i32()? as f64 / 100.0,
                    input_current: r.i32()? as f64 / 100.0,
                    duty_cycle: r.i16()? as f64 / 1000.0,
                    rpm: r.i32()?,
                    input_voltage: r.i16()? as f64 / 10.0,
                    amp_hours: r.i32()? as f64 / 10_000.0,
                    amp_hours_charged: r.i32()? as f64 / 10_000.0,
                    watt_hours: r.i32()? as f64 / 10_000.0,
                    watt_hours_charged: r.i32()? as f64 / 10_000.0,
                    tachometer: r.i32()?,
                    tachometer_abs: r.i32()?,
                    fault_code: r.u8()?,
                    controller_id: vec![r.u8()?],
                };
                Ok(Self::Values(values))
            }
            COMM_FW_VERSION => Ok(Self::Version(Version {
                major: r.u8()?,
                minor: r.u8()?,
            })),
            COMM_GET_ROTOR_POSITION => Ok(Self::RotorPosition(RotorPosition {
                degrees: r.i32()? as f64 / 100_000.0,
            })),
            other => Err(BoardError::Codec(format!("unknown frame id {other}"))),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BoardError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(BoardError::Codec("truncated payload".to_string()));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BoardError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, BoardError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, BoardError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ---------------------------------------------------------------------------
// Incremental decoder
// ---------------------------------------------------------------------------

/// Accumulates raw serial bytes and yields complete decoded frames.
///
/// Corrupt or unknown frames are dropped and scanning continues at the next
/// plausible start byte, so a noisy line cannot wedge the stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if one is ready.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let (frame, consumed) = self.scan();
            if consumed == 0 {
                return None;
            }
            self.buf.drain(..consumed);
            if frame.is_some() {
                return frame;
            }
        }
    }

    /// Examine the buffer head: returns the decoded frame (if any) and how
    /// many bytes to discard.  `(None, 0)` means "need more data".
    fn scan(&self) -> (Option<Frame>, usize) {
        let Some(start) = self.buf.iter().position(|&b| b == START) else {
            // Nothing but garbage.
            return (None, self.buf.len());
        };
        if start > 0 {
            return (None, start);
        }
        if self.buf.len() < 2 {
            return (None, 0);
        }
        let len = self.buf[1] as usize;
        if len > MAX_PAYLOAD {
            return (None, 1);
        }
        let total = len + 5;
        if self.buf.len() < total {
            return (None, 0);
        }
        let payload = &self.buf[2..2 + len];
        let crc = u16::from_be_bytes([self.buf[2 + len], self.buf[3 + len]]);
        if self.buf[total - 1] != TERMINATOR || crc16(payload) != crc {
            // False start byte; resynchronise one byte further on.
            return (None, 1);
        }
        match Frame::decode(payload) {
            Ok(frame) => (Some(frame), total),
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                (None, total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Values {
        Values {
            temp_fet: 31.5,
            temp_motor: 28.0,
            motor_current: 12.34,
            input_current: 6.78,
            duty_cycle: 0.42,
            rpm: -3500,
            input_voltage: 36.7,
            amp_hours: 1.2345,
            amp_hours_charged: 0.1,
            watt_hours: 45.6789,
            watt_hours_charged: 2.5,
            tachometer: 123_456,
            tachometer_abs: 654_321,
            fault_code: 0,
            controller_id: vec![124],
        }
    }

    #[test]
    fn crc16_known_check_value() {
        // The standard CRC-16/XMODEM check string.
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn set_rpm_frame_layout() {
        let bytes = DeviceMessage::SetRpm(1000).encode();
        assert_eq!(bytes[0], START);
        assert_eq!(bytes[1], 5); // id + i32
        assert_eq!(bytes[2], 8); // COMM_SET_RPM
        assert_eq!(&bytes[3..7], &1000i32.to_be_bytes());
        assert_eq!(*bytes.last().unwrap(), TERMINATOR);
    }

    #[test]
    fn forwarded_frame_wraps_payload() {
        let plain = DeviceMessage::SetCurrent(0.0).encode();
        let forwarded = DeviceMessage::SetCurrent(0.0).encode_forwarded(124);
        assert_eq!(forwarded[2], COMM_FORWARD_CAN);
        assert_eq!(forwarded[3], 124);
        // Inner payload is the plain payload.
        assert_eq!(&forwarded[4..4 + plain.len() - 5], &plain[2..plain.len() - 3]);
    }

    #[test]
    fn registry_resolves_known_names() {
        let mut fields = serde_json::Map::new();
        fields.insert("rpm".to_string(), serde_json::json!(2500));
        let msg = DeviceMessage::from_envelope("SetRPM", &fields).unwrap();
        assert_eq!(msg, Some(DeviceMessage::SetRpm(2500)));

        let msg = DeviceMessage::from_envelope("GetValues", &serde_json::Map::new()).unwrap();
        assert_eq!(msg, Some(DeviceMessage::GetValues));
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let result = DeviceMessage::from_envelope("SET_TARGET", &serde_json::Map::new());
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn registry_reports_bad_fields() {
        let mut fields = serde_json::Map::new();
        fields.insert("rpm".to_string(), serde_json::json!("fast"));
        let result = DeviceMessage::from_envelope("SetRPM", &fields);
        assert!(result.is_err());
    }

    #[test]
    fn decoder_yields_values_frame() {
        let values = sample_values();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&Frame::Values(values.clone()).encode());

        match decoder.next_frame() {
            Some(Frame::Values(decoded)) => {
                assert_eq!(decoded.rpm, values.rpm);
                assert_eq!(decoded.fault_code, values.fault_code);
                assert_eq!(decoded.controller_id, values.controller_id);
                assert!((decoded.temp_fet - values.temp_fet).abs() < 0.11);
                assert!((decoded.input_voltage - values.input_voltage).abs() < 0.11);
            }
            other => panic!("expected Values frame, got {other:?}"),
        }
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_handles_split_input() {
        let bytes = Frame::Version(Version { major: 3, minor: 62 }).encode();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..3]);
        assert!(decoder.next_frame().is_none());

        decoder.extend(&bytes[3..]);
        assert_eq!(
            decoder.next_frame(),
            Some(Frame::Version(Version { major: 3, minor: 62 }))
        );
    }

    #[test]
    fn decoder_resyncs_past_garbage() {
        let good = Frame::RotorPosition(RotorPosition { degrees: 90.0 }).encode();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xFF, 0x10, START, 0x99]); // noise, including a false start
        decoder.extend(&good);

        match decoder.next_frame() {
            Some(Frame::RotorPosition(p)) => assert!((p.degrees - 90.0).abs() < 1e-4),
            other => panic!("expected RotorPosition frame, got {other:?}"),
        }
    }

    #[test]
    fn decoder_drops_bad_crc() {
        let mut bytes = Frame::Version(Version { major: 1, minor: 0 }).encode();
        let crc_pos = bytes.len() - 3;
        bytes[crc_pos] ^= 0xFF;
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert!(decoder.next_frame().is_none());

        // A clean frame after the corrupt one still decodes.
        decoder.extend(&Frame::Version(Version { major: 1, minor: 0 }).encode());
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn values_fields_keep_wire_order_and_types() {
        let fields = Frame::Values(sample_values()).fields();
        assert_eq!(fields[0].0, "temp_fet");
        assert_eq!(fields[5], ("rpm", FieldValue::Int(-3500)));
        assert_eq!(
            fields.last().unwrap(),
            &("controller_id", FieldValue::Bytes(vec![124]))
        );
    }
}

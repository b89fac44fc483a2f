//! Adapter response decoding
//!
//! [`decode`] turns one raw adapter response and its PID descriptor into a
//! physical value. It never fails: adapter errors, negative responses and
//! malformed text all come back as NaN, the "unknown" sentinel.

use super::formula::{self, Bindings};
use super::multiframe;
use super::pid::{PidDescriptor, PidType};
use thiserror::Error;

/// Service byte of a negative response
pub const NEGATIVE_RESPONSE_CODE: u8 = 0x7F;

/// Shortest normalized response worth parsing (service byte plus PID echo)
pub const MIN_RESPONSE_LEN: usize = 4;

const ERROR_TOKENS: &[&str] = &[
    "NODATA",
    "ERROR",
    "?",
    "UNABLETOCONNECT",
    "CANERROR",
    "BUSERROR",
    "BUSBUSY",
    "FBERROR",
    "DATAERROR",
    "BUFFERFULL",
    "STOPPED",
];

/// Why a response could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("adapter reported {0}")]
    AdapterError(String),
    #[error("response too short")]
    TooShort,
    #[error("negative response")]
    NegativeResponse,
}

/// Response text after normalization and header stripping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// CAN identifier stripped from the front, if one was present
    pub header: Option<String>,
    /// Parsed bytes (PCI byte first when a header was present)
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Index of the service byte within [`Frame::bytes`]
    pub fn service_index(&self) -> usize {
        usize::from(self.header.is_some())
    }
}

/// Strip whitespace, prompt characters and search banners; uppercase the rest
pub fn normalize(raw: &str) -> String {
    let upper: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '>' && *c != '\0')
        .collect::<String>()
        .to_uppercase();
    upper.replace("SEARCHING...", "")
}

/// Whether `s` starts with a 3-nibble 11-bit CAN response identifier
pub fn is_can_id(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 3 && b[0] == b'7' && b[1].is_ascii_hexdigit() && b[2].is_ascii_hexdigit()
}

/// Split a normalized response into its header and bytes
pub fn parse_frame(raw: &str) -> Result<Frame, DecodeFailure> {
    let text = normalize(raw);

    if let Some(token) = ERROR_TOKENS.iter().find(|t| text.contains(**t)) {
        return Err(DecodeFailure::AdapterError((*token).to_string()));
    }
    if text.len() < MIN_RESPONSE_LEN {
        return Err(DecodeFailure::TooShort);
    }

    // An even-length "7F.." is a headerless negative response, not an ID
    let has_header = is_can_id(&text) && !(text.starts_with("7F") && text.len() % 2 == 0);
    let (header, body) = if has_header {
        (Some(text[..3].to_string()), &text[3..])
    } else {
        (None, text.as_str())
    };

    let body = body.as_bytes();
    let even = &body[..body.len() - body.len() % 2];
    let bytes: Vec<u8> = even
        .chunks(2)
        .map_while(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect();

    let frame = Frame { header, bytes };
    if frame.bytes.get(frame.service_index()) == Some(&NEGATIVE_RESPONSE_CODE) {
        return Err(DecodeFailure::NegativeResponse);
    }
    Ok(frame)
}

/// Decode a response, reporting why it failed
///
/// A response spanning several CAN frames is decoded from its reassembled
/// ISO-TP payload, so `B0` is the service byte and indices run across
/// frame boundaries.
pub fn try_decode(response: &str, pid: &PidDescriptor) -> Result<f64, DecodeFailure> {
    let mut frame = parse_frame(response)?;
    if multiframe::split_frames(response).len() > 1 {
        frame = Frame {
            header: None,
            bytes: multiframe::reassemble_payload(response),
        };
    }

    let value = match pid.formula() {
        Some(f) => evaluate_formula(f, &frame),
        None if pid.pid_type().is_array() => {
            let cells = multiframe::reassemble_cells(response, pid.pid_type());
            multiframe::mean(&cells).unwrap_or(f64::NAN)
        }
        None => builtin(pid.pid_type(), &frame),
    };

    Ok(if value.is_finite() { value } else { f64::NAN })
}

/// Decode a response into a value, NaN when it cannot be decoded
pub fn decode(response: &str, pid: &PidDescriptor) -> f64 {
    try_decode(response, pid).unwrap_or(f64::NAN)
}

fn evaluate_formula(formula_text: &str, frame: &Frame) -> f64 {
    if formula::is_indexed_notation(formula_text) {
        return formula::evaluate(formula_text, &Bindings::Indexed(&frame.bytes));
    }
    formula::evaluate(formula_text, &Bindings::symbolic(symbolic_payload(frame)))
}

/// Payload for `A`..`D`: after the positive-response marker and PID echo,
/// otherwise two bytes in
fn symbolic_payload(frame: &Frame) -> &[u8] {
    let service = frame.service_index();
    let start = match frame.bytes.get(service) {
        Some(0x62) => service + 3,
        Some(b) if (0x41..0x7F).contains(b) => service + 2,
        _ => 2,
    };
    frame.bytes.get(start..).unwrap_or(&[])
}

/// Built-in rule for a PID type
///
/// Offsets count from the service byte, so the PCI byte that follows a
/// CAN header is skipped: the first value byte sits at `service_index + 2`.
fn builtin(pid_type: PidType, frame: &Frame) -> f64 {
    let bytes = &frame.bytes;
    let base = frame.service_index() + 2;
    let be = |len: usize| -> Option<f64> {
        let span = bytes.get(base..base + len)?;
        Some(span.iter().fold(0.0, |acc, b| acc * 256.0 + f64::from(*b)))
    };

    let value = match pid_type {
        PidType::Speed | PidType::Custom => be(1),
        PidType::StateOfCharge => be(1).map(|v| (v * 100.0 / 255.0).clamp(0.0, 100.0)),
        PidType::BatteryVoltage => be(2).map(|v| v * 0.001),
        PidType::Odometer => be(4).map(|v| v * 0.1),
        PidType::CumulativeCharge | PidType::CumulativeDischarge => bytes
            .len()
            .checked_sub(4)
            .map(|start| {
                bytes[start..]
                    .iter()
                    .fold(0.0, |acc, b| acc * 256.0 + f64::from(*b))
            }),
        PidType::CellVoltages | PidType::CellTemperatures => None,
    };
    value.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(t: PidType) -> PidDescriptor {
        PidDescriptor::new("test", "0100", t)
    }

    #[test]
    fn state_of_charge_builtin() {
        let v = decode("410D5A", &pid(PidType::StateOfCharge));
        assert!((v - 90.0 * 100.0 / 255.0).abs() < 1e-9);
    }

    #[test]
    fn state_of_charge_clamped() {
        assert_eq!(decode("415BFF", &pid(PidType::StateOfCharge)), 100.0);
    }

    #[test]
    fn speed_with_prompt_and_spaces() {
        assert_eq!(decode("41 0D 3C \r\n>", &pid(PidType::Speed)), 60.0);
    }

    #[test]
    fn header_is_stripped_before_offsets() {
        // 7E8 header, PCI 03, then 41 0D 3C
        assert_eq!(decode("7E8 03 41 0D 3C", &pid(PidType::Speed)), 60.0);
    }

    #[test]
    fn cumulative_charge_uses_last_four_bytes() {
        let v = decode("62010500000004D2", &pid(PidType::CumulativeCharge));
        assert_eq!(v, 1234.0);
        let v = decode("7EC 10 62 01 05 00 00 04 D2", &pid(PidType::CumulativeDischarge));
        assert_eq!(v, 1234.0);
    }

    #[test]
    fn battery_voltage_and_odometer() {
        assert!((decode("41420DAC", &pid(PidType::BatteryVoltage)) - 3.5).abs() < 1e-9);
        assert!((decode("41A60001E240", &pid(PidType::Odometer)) - 12345.6).abs() < 1e-6);
    }

    #[test]
    fn insufficient_bytes_builtin_is_zero() {
        assert_eq!(decode("410D", &pid(PidType::Speed)), 0.0);
        assert_eq!(decode("41A601", &pid(PidType::Odometer)), 0.0);
    }

    #[test]
    fn adapter_errors_are_nan() {
        for r in ["NO DATA", "CAN ERROR", "?", "UNABLE TO CONNECT", "41", "", "STOPPED>"] {
            assert!(decode(r, &pid(PidType::Speed)).is_nan(), "{r}");
        }
        assert_eq!(
            try_decode("NO DATA", &pid(PidType::Speed)),
            Err(DecodeFailure::AdapterError("NODATA".to_string()))
        );
    }

    #[test]
    fn negative_response_with_header_is_nan() {
        let p = pid(PidType::Custom).with_formula("B3");
        assert!(decode("7EC037F2212", &p).is_nan());
        assert_eq!(
            try_decode("7EC 03 7F 22 12", &pid(PidType::Speed)),
            Err(DecodeFailure::NegativeResponse)
        );
    }

    #[test]
    fn negative_response_without_header_is_nan() {
        assert!(decode("7F0112", &pid(PidType::Speed)).is_nan());
    }

    #[test]
    fn data_byte_equal_to_negative_code_is_not_negative() {
        // 7F sits at a data position, not the service position
        assert_eq!(decode("7E8 03 41 0D 7F", &pid(PidType::Speed)), 127.0);
    }

    #[test]
    fn trailing_odd_nibble_dropped() {
        assert_eq!(decode("410D3C5", &pid(PidType::Speed)), 60.0);
    }

    #[test]
    fn parsing_stops_at_non_hex() {
        assert_eq!(decode("410D3CZZ10", &pid(PidType::Speed)), 60.0);
    }

    #[test]
    fn symbolic_formula_after_service_marker() {
        let p = pid(PidType::Custom).with_formula("(A*256+B)/4");
        // 41 0C 1A F8 → (26*256+248)/4
        assert_eq!(decode("410C1AF8", &p), 1726.0);
        let p = pid(PidType::Custom).with_formula("A-40");
        // 62 01 01 | 5A
        assert_eq!(decode("6201015A", &p), 50.0);
    }

    #[test]
    fn indexed_formula_uses_absolute_bytes() {
        let p = pid(PidType::BatteryVoltage).with_formula("[B3:B4]/10");
        assert_eq!(decode("6201010DAC", &p), 350.0);
    }

    const PACK_STATUS: &str = "7EC 10 14 62 01 01 FF F7 E7\r\
                               7EC 21 FF 8A 0E 26 00 00 64\r\
                               7EC 22 0E 74 00 00 00 00 00\r\r>";

    #[test]
    fn indexed_formula_spans_frames() {
        let table = crate::obd::PidTable::default_ev();
        let voltage = table.get("BatteryVoltage").unwrap();
        assert!((decode(PACK_STATUS, voltage) - 370.0).abs() < 1e-9);
        let current = table.get("BatteryCurrent").unwrap();
        assert!((decode(PACK_STATUS, current) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn next_frame_identifier_is_not_data() {
        let p = pid(PidType::Custom).with_formula("B8");
        let two_frames = "7EC 10 0E 62 01 01 FF F7 E7\r7EC 21 FF 8A 0E 26 00 00 00";
        assert_eq!(decode(two_frames, &p), 14.0);
        // 0xFF is a value here, not a gap
        let p = pid(PidType::Custom).with_formula("B3");
        assert_eq!(decode(PACK_STATUS, &p), 255.0);
    }

    #[test]
    fn symbolic_formula_on_multi_frame_payload() {
        let p = pid(PidType::Custom).with_formula("A+B");
        assert_eq!(decode(PACK_STATUS, &p), 255.0 + 247.0);
    }

    #[test]
    fn formula_overrides_builtin() {
        let p = pid(PidType::Speed).with_formula("A*2");
        assert_eq!(decode("410D3C", &p), 120.0);
    }

    #[test]
    fn formula_with_missing_bytes_is_nan() {
        let p = pid(PidType::Custom).with_formula("B9");
        assert!(decode("410D3C", &p).is_nan());
    }

    #[test]
    fn never_panics_on_garbage() {
        let p = pid(PidType::Odometer).with_formula("[B0:B3]>>B1");
        for r in ["7", "7E", "7E8", "7E80", "ZZZZ", "7F7F7F", "\u{1F600}41 0D", "4141414141414141"] {
            let v = decode(r, &p);
            assert!(v.is_nan() || v.is_finite());
            let v = decode(r, &pid(PidType::CellVoltages));
            assert!(v.is_nan() || v.is_finite());
        }
    }
}

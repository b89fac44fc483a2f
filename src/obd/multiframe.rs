//! ISO-TP multi-frame reassembly for per-cell arrays
//!
//! The adapter prints every CAN frame of a long response prefixed with the
//! responding ECU's identifier. The first frame carries the ISO-TP length
//! and the service/PID echo before its data; consecutive frames carry a
//! sequence nibble. Data bytes are joined in frame order and mapped to cell
//! voltages or temperatures, dropping values outside the physical band.

use super::decoder::{is_can_id, normalize};
use super::pid::PidType;

/// Hex characters before the data of a consecutive frame (ID, PCI + sequence)
pub const CONSECUTIVE_FRAME_HEADER_LEN: usize = 5;

/// Hex characters up to the end of a first frame's PCI and length
const FIRST_FRAME_PCI_END: usize = 7;

/// Hex characters up to the end of a single frame's PCI and length
const SINGLE_FRAME_PCI_END: usize = 5;

/// Bytes of the service code and two-byte PID echo counted by the ISO-TP length
const ECHO_LEN: usize = 3;

/// "Not available" marker inside cell arrays
const NOT_AVAILABLE: u8 = 0xFF;

/// Padding patterns seen after the last data byte
const PADDING: [u8; 3] = [0x55, 0xAA, 0xFF];

pub const CELL_VOLTAGE_RANGE: (f64, f64) = (2.5, 4.5);
pub const CELL_TEMPERATURE_RANGE: (f64, f64) = (-40.0, 80.0);

/// Split a response into frames, each starting with the ECU identifier
///
/// An occurrence of the identifier only starts a new frame when it is
/// followed by the next expected consecutive-frame sequence nibble, so data
/// bytes that happen to spell the identifier stay in place.
pub fn split_frames(raw: &str) -> Vec<String> {
    let text = normalize(raw);
    if !is_can_id(&text) {
        return Vec::new();
    }
    let id = &text[..3];

    let mut frames = Vec::new();
    let mut start = 0;
    let mut pos = 3;
    let mut seq: u8 = 1;
    while let Some(offset) = text[pos..].find(id) {
        let at = pos + offset;
        let expected = format!("{}2{:X}", id, seq & 0x0F);
        if text[at..].starts_with(&expected) {
            frames.push(text[start..at].to_string());
            start = at;
            pos = at + CONSECUTIVE_FRAME_HEADER_LEN;
            seq = seq.wrapping_add(1);
        } else {
            pos = at + 1;
        }
    }
    frames.push(text[start..].to_string());
    frames
}

/// Full ISO-TP payload from the service byte on, with the declared length
fn payload_parts(raw: &str) -> Option<(Vec<u8>, Option<usize>)> {
    let frames = split_frames(raw);
    let first = frames.first()?;

    let (mut payload, declared) = match first.as_bytes().get(3) {
        Some(b'1') => (
            hex_bytes(first.get(FIRST_FRAME_PCI_END..)),
            first
                .get(4..FIRST_FRAME_PCI_END)
                .and_then(|s| usize::from_str_radix(s, 16).ok()),
        ),
        Some(b'0') => (
            hex_bytes(first.get(SINGLE_FRAME_PCI_END..)),
            first
                .get(4..SINGLE_FRAME_PCI_END)
                .and_then(|s| usize::from_str_radix(s, 16).ok()),
        ),
        _ => (hex_bytes(first.get(FIRST_FRAME_PCI_END..)), None),
    };

    for frame in &frames[1..] {
        payload.extend(hex_bytes(frame.get(CONSECUTIVE_FRAME_HEADER_LEN..)));
    }
    Some((payload, declared))
}

/// Reassembled payload starting at the service byte, cut to the declared
/// length. Unlike [`reassemble`], 0xFF bytes and padding are kept.
pub fn reassemble_payload(raw: &str) -> Vec<u8> {
    let Some((mut payload, declared)) = payload_parts(raw) else {
        return Vec::new();
    };
    if let Some(len) = declared {
        payload.truncate(len);
    }
    payload
}

/// Joined data bytes of a multi-frame response, padding and gaps removed
pub fn reassemble(raw: &str) -> Vec<u8> {
    let Some((mut payload, declared)) = payload_parts(raw) else {
        return Vec::new();
    };
    let mut data = if payload.len() > ECHO_LEN {
        payload.split_off(ECHO_LEN)
    } else {
        Vec::new()
    };

    match declared {
        Some(len) => data.truncate(len.saturating_sub(ECHO_LEN)),
        None => {
            while data.last().is_some_and(|b| PADDING.contains(b)) {
                data.pop();
            }
        }
    }

    data.retain(|b| *b != NOT_AVAILABLE);
    data
}

/// Per-cell values of an array PID, out-of-band values dropped
pub fn reassemble_cells(raw: &str, pid_type: PidType) -> Vec<f64> {
    let scale: fn(u8) -> Option<f64> = match pid_type {
        PidType::CellVoltages => cell_voltage,
        PidType::CellTemperatures => cell_temperature,
        _ => return Vec::new(),
    };
    reassemble(raw).into_iter().filter_map(scale).collect()
}

/// Cell voltage of a raw byte, `None` outside the plausible band
///
/// 0xB9 maps to 5.7 V and is therefore rejected.
pub fn cell_voltage(byte: u8) -> Option<f64> {
    let v = f64::from(byte) * 0.02 + 2.0;
    (CELL_VOLTAGE_RANGE.0..=CELL_VOLTAGE_RANGE.1)
        .contains(&v)
        .then_some(v)
}

/// Cell/module temperature of a raw byte, `None` outside the plausible band
pub fn cell_temperature(byte: u8) -> Option<f64> {
    let t = f64::from(byte) - 40.0;
    (CELL_TEMPERATURE_RANGE.0..=CELL_TEMPERATURE_RANGE.1)
        .contains(&t)
        .then_some(t)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn hex_bytes(hex: Option<&str>) -> Vec<u8> {
    let Some(hex) = hex else {
        return Vec::new();
    };
    hex.as_bytes()
        .chunks_exact(2)
        .map_while(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

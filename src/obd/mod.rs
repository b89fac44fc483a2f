//! OBD-II response decoding
//!
//! - `pid`: PID descriptors and the persisted PID table
//! - `formula`: custom formula interpreter
//! - `decoder`: single-response decoding into a physical value
//! - `multiframe`: ISO-TP reassembly for per-cell arrays

pub mod decoder;
pub mod formula;
pub mod multiframe;
pub mod pid;

pub use decoder::{DecodeFailure, decode, try_decode};
pub use multiframe::{reassemble, reassemble_cells, reassemble_payload};
pub use pid::{PidDescriptor, PidTable, PidType, Priority};

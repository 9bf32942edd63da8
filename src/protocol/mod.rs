//! Protocol module for the bed sensor wire format.
//!
//! Every numeric characteristic on the sensor carries a single IEEE-754
//! single precision float, little-endian, exactly four bytes long.

pub mod payload;

pub use payload::{decode_f32, encode_f32, is_uncalibrated, PAYLOAD_LEN};

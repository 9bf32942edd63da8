//! Characteristic payload encoding and decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Length of every numeric characteristic payload in bytes.
pub const PAYLOAD_LEN: usize = 4;

/// Decode a little-endian `f32` characteristic payload.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if `data` is not exactly
/// [`PAYLOAD_LEN`] bytes long.
///
/// # Example
///
/// ```
/// use bedsense_ble::protocol::decode_f32;
///
/// let value = decode_f32(&[0x00, 0x00, 0xA0, 0x41]).unwrap();
/// assert_eq!(value, 20.0);
/// ```
pub fn decode_f32(data: &[u8]) -> Result<f32> {
    if data.len() != PAYLOAD_LEN {
        return Err(Error::InvalidPayload {
            expected: PAYLOAD_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    Ok(buf.get_f32_le())
}

/// Encode an `f32` as a little-endian characteristic payload.
pub fn encode_f32(value: f32) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_LEN);
    buf.put_f32_le(value);
    buf.freeze()
}

/// A calibration characteristic that was never written reads back as zeros.
pub fn is_uncalibrated(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_known_value() {
        assert_eq!(decode_f32(&30.0f32.to_le_bytes()).unwrap(), 30.0);
        assert_eq!(decode_f32(&[0x00, 0x00, 0xA0, 0x41]).unwrap(), 20.0);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        for len in [0usize, 1, 3, 5, 8] {
            let data = vec![0u8; len];
            match decode_f32(&data) {
                Err(Error::InvalidPayload { expected, actual }) => {
                    assert_eq!(expected, PAYLOAD_LEN);
                    assert_eq!(actual, len);
                }
                other => panic!("expected InvalidPayload for {len} bytes, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_encode_is_little_endian() {
        assert_eq!(encode_f32(20.0).as_ref(), &[0x00, 0x00, 0xA0, 0x41]);
    }

    #[test]
    fn test_is_uncalibrated() {
        assert!(is_uncalibrated(&[0, 0, 0, 0]));
        assert!(is_uncalibrated(&[]));
        assert!(!is_uncalibrated(&[0, 0, 0xA0, 0x41]));
        // Negative zero is not all-zero bytes.
        assert!(!is_uncalibrated(&(-0.0f32).to_le_bytes()));
    }

    proptest! {
        #[test]
        fn prop_encode_decode_is_bit_exact(bits in any::<u32>()) {
            let value = f32::from_bits(bits);
            let decoded = decode_f32(&encode_f32(value)).unwrap();
            prop_assert_eq!(decoded.to_bits(), bits);
        }
    }
}

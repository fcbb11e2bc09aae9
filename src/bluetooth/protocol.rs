/// Accelerometer wire format and fixed GATT identifiers
use bluer::Uuid;

use crate::error::DecodeError;

// Accelerometer protocol constants
pub const ACCELEROMETER_SERVICE_UUID: Uuid = Uuid::from_u128(0xE95D0753_251D_470A_A062_FA1922DFA9A8);
pub const ACCELEROMETER_DATA_UUID: Uuid = Uuid::from_u128(0xE95DCA4B_251D_470A_A062_FA1922DFA9A8);
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB); // CCCD, enables notifications
pub const SAMPLE_PAYLOAD_LEN: usize = 6;
const AXIS_SCALE: f64 = 1000.0; // raw counts per physical unit

/// Decode one accelerometer axis from two notification bytes
///
/// `first` becomes the high byte and `second` the low byte of an unsigned
/// 16-bit word, which is then read as two's complement and scaled by 1/1000.
///
/// # Arguments
/// * `first` - Byte placed in the high half of the word
/// * `second` - Byte placed in the low half of the word
///
/// # Returns
/// Physical axis value, always within (-65.536, 65.536)
pub fn decode_axis(first: u8, second: u8) -> f64 {
    let raw = (u32::from(first) << 8) | u32::from(second);
    let signed = if raw & 0x8000 != 0 {
        raw as i32 - 0x10000
    } else {
        raw as i32
    };
    f64::from(signed) / AXIS_SCALE
}

/// Decode a six-byte accelerometer notification
///
/// Payload layout, one little-endian signed 16-bit word per axis:
/// - Bytes 0-1: X
/// - Bytes 2-3: Y
/// - Bytes 4-5: Z
///
/// Each pair is consumed as (byte 1, byte 0), (byte 3, byte 2), (byte 5, byte 4).
/// Do not reorder: the sensor firmware defines this pairing.
///
/// # Returns
/// `(x, y, z)` or `MalformedPayload` when the length is not exactly six
pub fn decode_sample(payload: &[u8]) -> Result<(f64, f64, f64), DecodeError> {
    if payload.len() != SAMPLE_PAYLOAD_LEN {
        return Err(DecodeError::MalformedPayload {
            len: payload.len(),
        });
    }

    Ok((
        decode_axis(payload[1], payload[0]),
        decode_axis(payload[3], payload[2]),
        decode_axis(payload[5], payload[4]),
    ))
}

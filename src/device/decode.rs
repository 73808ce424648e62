use crate::device::constants::FLAG_HEART_RATE_VALUE_UINT16;
use crate::error::ProtocolError;

/// Decodes one Heart Rate Measurement characteristic value.
///
/// Byte 0 is the flags byte; its bit 0 selects the width of the heart rate
/// value starting at byte 1: UINT8, or little-endian UINT16. The remaining
/// flag bits (sensor contact, energy expended, RR intervals) are accepted
/// but not interpreted. Inputs too short for the selected width are
/// rejected rather than read out of bounds.
pub fn decode_measurement(value: &[u8]) -> Result<u16, ProtocolError> {
    let flags = *value.first().ok_or(ProtocolError::Empty)?;

    if flags & FLAG_HEART_RATE_VALUE_UINT16 == 0 {
        let bpm = *value.get(1).ok_or(ProtocolError::Truncated)?;
        Ok(u16::from(bpm))
    } else {
        match value.get(1..3) {
            Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
            None => Err(ProtocolError::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint8_values_decode_exactly() {
        for v in 0..=255u8 {
            assert_eq!(decode_measurement(&[0x00, v]), Ok(u16::from(v)));
        }
    }

    #[test]
    fn uint8_ignores_other_flag_bits() {
        // sensor contact + energy expended + RR interval bits set, bit 0 clear
        assert_eq!(decode_measurement(&[0xFE, 72]), Ok(72));
    }

    #[test]
    fn uint16_values_decode_little_endian() {
        for (lo, hi) in [(0u8, 0u8), (0x4B, 0x00), (0x00, 0x01), (0x34, 0x12), (0xFF, 0xFF)] {
            let expected = u16::from(lo) + u16::from(hi) * 256;
            assert_eq!(decode_measurement(&[0x01, lo, hi]), Ok(expected));
        }
    }

    #[test]
    fn uint16_ignores_trailing_fields() {
        // RR intervals appended after the value field
        assert_eq!(decode_measurement(&[0x11, 0x50, 0x00, 0x34, 0x02]), Ok(80));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(decode_measurement(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn uint8_without_value_byte_is_truncated() {
        assert_eq!(decode_measurement(&[0x00]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn uint16_without_value_bytes_is_truncated() {
        assert_eq!(decode_measurement(&[0x01]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn uint16_with_one_value_byte_is_truncated() {
        assert_eq!(decode_measurement(&[0x01, 0x4B]), Err(ProtocolError::Truncated));
    }
}

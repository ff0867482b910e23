use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Encodes a UTF-8 string with a 2-byte big-endian length prefix
///
/// # Errors
///
/// Returns `MalformedPacket` if the string contains U+0000 or is longer
/// than 65,535 bytes
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    let len = u16::try_from(string.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "String length {} exceeds maximum {MAX_STRING_LENGTH}",
            string.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(string.as_bytes());
    Ok(())
}

/// Decodes a length-prefixed UTF-8 string
///
/// # Errors
///
/// Returns `MalformedPacket` on truncation, invalid UTF-8 or an embedded null
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for string length".to_string(),
        ));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for string data: expected {len}, got {}",
            buf.remaining()
        )));
    }

    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    let string = String::from_utf8(bytes)
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8: {e}")))?;
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    Ok(string)
}

/// Encoded length of a string: 2 length bytes plus the UTF-8 bytes
#[must_use]
pub fn string_len(string: &str) -> usize {
    2 + string.len()
}

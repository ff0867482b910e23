use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Encodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the data length exceeds 65,535 bytes
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "Binary data length {} exceeds maximum 65535",
            data.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Decodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if there are insufficient bytes in the buffer
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for binary data length".to_string(),
        ));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for binary data: expected {len}, got {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

#[must_use]
pub fn binary_len(data: &[u8]) -> usize {
    2 + data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_binary_round_trip() {
        let mut buf = BytesMut::new();
        encode_binary(&mut buf, &[1, 2, 3, 0]).unwrap();
        assert_eq!(&buf[..], &[0, 4, 1, 2, 3, 0]);
        assert_eq!(decode_binary(&mut buf).unwrap().as_ref(), &[1, 2, 3, 0]);
    }

    #[test]
    fn test_binary_too_long() {
        let mut buf = BytesMut::new();
        assert!(encode_binary(&mut buf, &vec![0u8; 65_536]).is_err());
    }

    #[test]
    fn test_binary_truncated() {
        let mut buf = BytesMut::from(&[0u8, 5, 1, 2][..]);
        assert!(decode_binary(&mut buf).is_err());
    }
}

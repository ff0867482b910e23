//! Streaming packet codec
//!
//! `decode_packet` never consumes input: it reports how many bytes a complete
//! packet occupied, or `NeedMoreData` when the buffer ends mid-packet, so a
//! reader can keep appending transport bytes and retry.

use crate::encoding::VariableInt;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, Packet};
use bytes::{Buf, BytesMut};

/// Outcome of one decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Complete { packet: Packet, consumed: usize },
    NeedMoreData,
}

/// Encodes `packet` into a fresh buffer
///
/// # Errors
///
/// Returns an error if any field cannot be encoded
pub fn encode_packet(packet: &Packet) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    encode_packet_into(packet, &mut buf)?;
    Ok(buf)
}

/// Appends the encoding of `packet` to `buf`
///
/// Nothing is appended when encoding fails.
///
/// # Errors
///
/// Returns an error if any field cannot be encoded
pub fn encode_packet_into(packet: &Packet, buf: &mut BytesMut) -> Result<()> {
    let start = buf.len();
    if let Err(e) = packet.encode(buf) {
        buf.truncate(start);
        return Err(e);
    }
    Ok(())
}

/// Attempts to decode one packet from the front of `bytes`
///
/// # Errors
///
/// `MalformedPacket` when the fixed header is invalid or the body does not
/// match its declared length, `ProtocolError` when the body is well formed
/// but breaks protocol rules
pub fn decode_packet(bytes: &[u8]) -> Result<Decoded> {
    decode_packet_limited(bytes, None)
}

/// Like [`decode_packet`], rejecting packets larger than `maximum_packet_size`
///
/// # Errors
///
/// Additionally returns `PacketTooLarge` once the declared size is known to
/// exceed the limit
pub fn decode_packet_limited(bytes: &[u8], maximum_packet_size: Option<u32>) -> Result<Decoded> {
    let Some(&first) = bytes.first() else {
        return Ok(Decoded::NeedMoreData);
    };
    let (packet_type, flags) = FixedHeader::parse_first_byte(first)?;

    let Some((remaining_length, length_len)) = VariableInt::peek(&bytes[1..])? else {
        return Ok(Decoded::NeedMoreData);
    };
    let remaining_length = remaining_length.value();
    let body_start = 1 + length_len;
    let total = body_start + remaining_length as usize;

    if let Some(max) = maximum_packet_size {
        if total > max as usize {
            return Err(MqttError::PacketTooLarge {
                size: total,
                max: max as usize,
            });
        }
    }
    if bytes.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let header = FixedHeader::new(packet_type, flags, remaining_length);
    let mut body = &bytes[body_start..total];
    let packet = Packet::decode_from_body(&header, &mut body)?;
    if body.has_remaining() {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} has {} trailing bytes beyond its contents",
            body.remaining()
        )));
    }

    tracing::trace!(?packet_type, consumed = total, "Decoded packet");
    Ok(Decoded::Complete {
        packet,
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::puback::PubAckPacket;
    use crate::packet::publish::PublishPacket;
    use crate::QoS;

    #[test]
    fn test_empty_and_partial_header() {
        assert_eq!(decode_packet(&[]).unwrap(), Decoded::NeedMoreData);
        assert_eq!(decode_packet(&[0x30]).unwrap(), Decoded::NeedMoreData);
        assert_eq!(decode_packet(&[0x30, 0x80]).unwrap(), Decoded::NeedMoreData);
    }

    #[test]
    fn test_remaining_length_over_four_bytes() {
        assert!(matches!(
            decode_packet(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_reserved_flags_rejected_before_body() {
        assert!(matches!(
            decode_packet(&[0x41]),
            Err(MqttError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_packet(&[0x80, 0x05]),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_body_shorter_than_contents() {
        // PUBACK claiming a 1 byte body
        assert!(matches!(
            decode_packet(&[0x40, 0x01, 0x00]),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_in_body() {
        // PINGRESP with a body
        assert!(decode_packet(&[0xD0, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_consumes_only_first_packet() {
        let mut buf = encode_packet(&Packet::PubAck(PubAckPacket::new(1))).unwrap();
        let first_len = buf.len();
        encode_packet_into(&Packet::PingResp, &mut buf).unwrap();

        match decode_packet(&buf).unwrap() {
            Decoded::Complete { packet, consumed } => {
                assert_eq!(packet, Packet::PubAck(PubAckPacket::new(1)));
                assert_eq!(consumed, first_len);
            }
            Decoded::NeedMoreData => panic!("expected a packet"),
        }
    }

    #[test]
    fn test_failed_encode_leaves_buffer_untouched() {
        let mut buf = encode_packet(&Packet::PingReq).unwrap();
        let mut publish = PublishPacket::new("t", &b"x"[..]).with_qos(QoS::AtLeastOnce, 1);
        publish.packet_id = None;
        assert!(encode_packet_into(&Packet::Publish(publish), &mut buf).is_err());
        assert_eq!(&buf[..], &[0xC0, 0x00]);
    }

    #[test]
    fn test_maximum_packet_size() {
        let buf = encode_packet(&Packet::Publish(PublishPacket::new("t", vec![0u8; 100]))).unwrap();
        assert!(matches!(
            decode_packet_limited(&buf, Some(50)),
            Err(MqttError::PacketTooLarge { .. })
        ));
        assert!(matches!(
            decode_packet_limited(&buf, Some(200)),
            Ok(Decoded::Complete { .. })
        ));
    }
}

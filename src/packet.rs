pub mod codec;
pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;


use crate::constants::fixed_header::REQUIRED_FLAGS;
use crate::encoding::{encode_variable_int, variable_int_len};
use crate::error::{MqttError, Result};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use bebytes::BeBytes;
use bytes::{Buf, BufMut, BytesMut};

/// Variable header shared by PUBACK, PUBREC, PUBREL and PUBCOMP
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct AckPacketHeader {
    #[bebytes(big_endian)]
    pub packet_id: u16,
    pub reason_code: u8,
}

impl AckPacketHeader {
    #[must_use]
    pub fn create(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code: u8::from(reason_code),
        }
    }

    #[must_use]
    pub fn get_reason_code(&self) -> Option<ReasonCode> {
        ReasonCode::from_u8(self.reason_code)
    }
}

/// First byte of the fixed header, split into its bit fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct MqttTypeAndFlags {
    #[bits(4)]
    pub message_type: u8,
    #[bits(1)]
    pub dup: u8,
    #[bits(2)]
    pub qos: u8,
    #[bits(1)]
    pub retain: u8,
}

impl MqttTypeAndFlags {
    /// Parses the first byte of a fixed header
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the byte cannot be split
    pub fn from_byte(byte: u8) -> Result<Self> {
        let (parsed, _) = Self::try_from_be_bytes(&[byte])
            .map_err(|e| MqttError::MalformedPacket(format!("Invalid fixed header: {e:?}")))?;
        Ok(parsed)
    }

    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.message_type)
    }

    /// The low nibble as a single value
    #[must_use]
    pub fn flags(&self) -> u8 {
        (self.dup << 3) | (self.qos << 1) | self.retain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BeBytes)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }

    /// The flag nibble every non-PUBLISH packet of this type must carry
    #[must_use]
    pub fn required_flags(&self) -> Option<u8> {
        match self {
            Self::Publish => None,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(REQUIRED_FLAGS),
            _ => Some(0),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Checks the type nibble and the reserved flag bits of a first header byte
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` for packet type 0 or reserved flag bits that
    /// do not match the required pattern
    pub fn parse_first_byte(byte: u8) -> Result<(PacketType, u8)> {
        let type_and_flags = MqttTypeAndFlags::from_byte(byte)?;
        let packet_type = type_and_flags.packet_type().ok_or_else(|| {
            MqttError::MalformedPacket(format!(
                "Reserved packet type {}",
                type_and_flags.message_type
            ))
        })?;
        let flags = type_and_flags.flags();
        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid flags 0x{flags:X} for {packet_type:?}"
                )));
            }
        }
        Ok((packet_type, flags))
    }

    /// # Errors
    ///
    /// Returns `ProtocolError` if the remaining length is too large
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(crate::constants::fixed_header::first_byte(
            self.packet_type,
            self.flags,
        ));
        encode_variable_int(buf, self.remaining_length)
    }

    /// Encoded size of the fixed header itself
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }
}

/// All control packets the client sends or receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<connect::ConnectPacket>),
    ConnAck(connack::ConnAckPacket),
    Publish(publish::PublishPacket),
    PubAck(puback::PubAckPacket),
    PubRec(pubrec::PubRecPacket),
    PubRel(pubrel::PubRelPacket),
    PubComp(pubcomp::PubCompPacket),
    Subscribe(subscribe::SubscribePacket),
    SubAck(suback::SubAckPacket),
    Unsubscribe(unsubscribe::UnsubscribePacket),
    UnsubAck(unsuback::UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(disconnect::DisconnectPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for the packet kinds that carry one
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::PubAck(p) => Some(p.packet_id),
            Self::PubRec(p) => Some(p.packet_id),
            Self::PubRel(p) => Some(p.packet_id),
            Self::PubComp(p) => Some(p.packet_id),
            Self::Subscribe(p) => Some(p.packet_id),
            Self::SubAck(p) => Some(p.packet_id),
            Self::Unsubscribe(p) => Some(p.packet_id),
            Self::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// Encodes the complete packet including its fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if any field cannot be encoded
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PubAck(p) => p.encode(buf),
            Self::PubRec(p) => p.encode(buf),
            Self::PubRel(p) => p.encode(buf),
            Self::PubComp(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubAck(p) => p.encode(buf),
            Self::PingReq | Self::PingResp => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
            Self::Disconnect(p) => p.encode(buf),
        }
    }

    /// Decode a packet body based on the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    pub fn decode_from_body<B: Buf>(fixed_header: &FixedHeader, buf: &mut B) -> Result<Self> {
        Ok(match fixed_header.packet_type {
            PacketType::Connect => Packet::Connect(Box::new(
                connect::ConnectPacket::decode_body(buf, fixed_header)?,
            )),
            PacketType::ConnAck => {
                Packet::ConnAck(connack::ConnAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::Publish => {
                Packet::Publish(publish::PublishPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PubAck => {
                Packet::PubAck(puback::PubAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PubRec => {
                Packet::PubRec(pubrec::PubRecPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PubRel => {
                Packet::PubRel(pubrel::PubRelPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PubComp => {
                Packet::PubComp(pubcomp::PubCompPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::Subscribe => {
                Packet::Subscribe(subscribe::SubscribePacket::decode_body(buf, fixed_header)?)
            }
            PacketType::SubAck => {
                Packet::SubAck(suback::SubAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::Unsubscribe => Packet::Unsubscribe(
                unsubscribe::UnsubscribePacket::decode_body(buf, fixed_header)?,
            ),
            PacketType::UnsubAck => {
                Packet::UnsubAck(unsuback::UnsubAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PingReq | PacketType::PingResp if fixed_header.remaining_length != 0 => {
                return Err(MqttError::MalformedPacket(format!(
                    "{:?} must have an empty body",
                    fixed_header.packet_type
                )));
            }
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => {
                Packet::Disconnect(disconnect::DisconnectPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::Auth => {
                return Err(MqttError::ProtocolError(
                    "AUTH packets are not supported without an authentication method".to_string(),
                ));
            }
        })
    }
}

/// Body encoding and decoding for one packet kind
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    /// Low nibble of the first fixed header byte
    fn flags(&self) -> u8 {
        self.packet_type().required_flags().unwrap_or(0)
    }

    /// Encodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// Decodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the body exceeds the maximum remaining length
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;

        let remaining_length = u32::try_from(body.len()).map_err(|_| {
            MqttError::ProtocolError(format!("Packet body of {} bytes is too large", body.len()))
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

/// Writes the shared PUBACK/PUBREC/PUBREL/PUBCOMP body
///
/// The reason code and property block are dropped whenever they carry
/// nothing beyond the defaults.
pub(crate) fn encode_ack_body<B: BufMut>(
    buf: &mut B,
    packet_type: PacketType,
    packet_id: u16,
    reason_code: ReasonCode,
    properties: &Properties,
) -> Result<()> {
    let has_properties = properties.encoded_len_for(packet_type) > 1;
    if reason_code == ReasonCode::Success && !has_properties {
        buf.put_u16(packet_id);
        return Ok(());
    }

    buf.put_slice(&AckPacketHeader::create(packet_id, reason_code).to_be_bytes());
    if has_properties {
        properties.encode_for(packet_type, buf)?;
    }
    Ok(())
}

/// Reads the shared PUBACK/PUBREC/PUBREL/PUBCOMP body
pub(crate) fn decode_ack_body<B: Buf>(
    buf: &mut B,
    packet_type: PacketType,
) -> Result<(u16, ReasonCode, Properties)> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} missing packet identifier"
        )));
    }
    if buf.remaining() == 2 {
        let packet_id = buf.get_u16();
        return Ok((
            nonzero_packet_id(packet_id, packet_type)?,
            ReasonCode::Success,
            Properties::default(),
        ));
    }

    let mut header_bytes = [0u8; 3];
    buf.copy_to_slice(&mut header_bytes);
    let (header, _) = AckPacketHeader::try_from_be_bytes(&header_bytes)
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid {packet_type:?}: {e:?}")))?;

    let reason_code = decode_reason_code(header.reason_code, packet_type)?;
    let properties = if buf.has_remaining() {
        Properties::decode_for(packet_type, buf)?
    } else {
        Properties::default()
    };
    Ok((
        nonzero_packet_id(header.packet_id, packet_type)?,
        reason_code,
        properties,
    ))
}

/// Maps a reason byte, rejecting codes not defined for `packet_type`
pub(crate) fn decode_reason_code(byte: u8, packet_type: PacketType) -> Result<ReasonCode> {
    ReasonCode::from_u8(byte)
        .filter(|code| code.is_valid_for(packet_type))
        .ok_or_else(|| {
            MqttError::MalformedPacket(format!(
                "Invalid {packet_type:?} reason code: 0x{byte:02X}"
            ))
        })
}

pub(crate) fn nonzero_packet_id(packet_id: u16, packet_type: PacketType) -> Result<u16> {
    if packet_id == 0 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} packet identifier must be non-zero"
        )));
    }
    Ok(packet_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(1), Some(PacketType::Connect));
        assert_eq!(PacketType::from_u8(14), Some(PacketType::Disconnect));
        assert_eq!(PacketType::from_u8(15), Some(PacketType::Auth));
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(16), None);
    }

    #[test]
    fn test_parse_first_byte() {
        assert_eq!(
            FixedHeader::parse_first_byte(0x3D).unwrap(),
            (PacketType::Publish, 0x0D)
        );
        assert_eq!(
            FixedHeader::parse_first_byte(0x62).unwrap(),
            (PacketType::PubRel, 0x02)
        );
        assert!(FixedHeader::parse_first_byte(0x60).is_err());
        assert!(FixedHeader::parse_first_byte(0x82 | 0x01).is_err());
        assert!(FixedHeader::parse_first_byte(0x41).is_err());
        assert!(FixedHeader::parse_first_byte(0x00).is_err());
    }

    #[test]
    fn test_fixed_header_encode() {
        let mut buf = BytesMut::new();
        FixedHeader::new(PacketType::Subscribe, 0x02, 321)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x82, 0xC1, 0x02]);
        assert_eq!(FixedHeader::new(PacketType::Subscribe, 0x02, 321).encoded_len(), 3);
    }

    #[test]
    fn test_ack_body_compact_forms() {
        let mut buf = BytesMut::new();
        encode_ack_body(
            &mut buf,
            PacketType::PubAck,
            7,
            ReasonCode::Success,
            &Properties::default(),
        )
        .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x07]);

        buf.clear();
        encode_ack_body(
            &mut buf,
            PacketType::PubAck,
            7,
            ReasonCode::NoMatchingSubscribers,
            &Properties::default(),
        )
        .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x07, 0x10]);

        let (id, code, props) = decode_ack_body(&mut buf, PacketType::PubAck).unwrap();
        assert_eq!(id, 7);
        assert_eq!(code, ReasonCode::NoMatchingSubscribers);
        assert!(props.is_empty());
    }

    #[test]
    fn test_ack_body_rejects_zero_id_and_bad_reason() {
        let mut buf = BytesMut::from(&[0x00u8, 0x00][..]);
        assert!(decode_ack_body(&mut buf, PacketType::PubAck).is_err());

        let mut buf = BytesMut::from(&[0x00u8, 0x01, 0x02][..]);
        assert!(decode_ack_body(&mut buf, PacketType::PubAck).is_err());
    }

    mod bebytes_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_type_and_flags_split(byte in any::<u8>()) {
                let parsed = MqttTypeAndFlags::from_byte(byte).unwrap();
                prop_assert_eq!(parsed.message_type, byte >> 4);
                prop_assert_eq!(parsed.flags(), byte & crate::constants::masks::FLAGS);
            }

            #[test]
            fn prop_ack_header_round_trip(packet_id in 1u16..=u16::MAX) {
                let header = AckPacketHeader::create(packet_id, ReasonCode::PacketIdentifierNotFound);
                let bytes = header.to_be_bytes();
                prop_assert_eq!(bytes.len(), 3);
                let (decoded, _) = AckPacketHeader::try_from_be_bytes(&bytes).unwrap();
                prop_assert_eq!(decoded, header);
                prop_assert_eq!(decoded.get_reason_code(), Some(ReasonCode::PacketIdentifierNotFound));
            }
        }
    }
}

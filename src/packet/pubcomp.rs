use crate::error::Result;
use crate::packet::{decode_ack_body, encode_ack_body, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use bytes::{Buf, BufMut};

/// MQTT PUBCOMP packet (QoS 2 publish complete, part 3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubCompPacket {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubCompPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self::new_with_reason(packet_id, ReasonCode::Success)
    }

    #[must_use]
    pub fn new_with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::default(),
        }
    }

    /// Answer to a PUBREL whose packet identifier has no stored message
    #[must_use]
    pub fn not_found(packet_id: u16) -> Self {
        Self::new_with_reason(packet_id, ReasonCode::PacketIdentifierNotFound)
    }
}

impl MqttPacket for PubCompPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::PubComp
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_ack_body(
            buf,
            PacketType::PubComp,
            self.packet_id,
            self.reason_code,
            &self.properties,
        )
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let (packet_id, reason_code, properties) = decode_ack_body(buf, PacketType::PubComp)?;
        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }
}

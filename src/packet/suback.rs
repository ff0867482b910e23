use crate::error::{MqttError, Result};
use crate::packet::{decode_reason_code, nonzero_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::{ReasonCode, GRANTED_QOS_0};
use crate::QoS;
use bytes::{Buf, BufMut};

/// MQTT v5.0 SUBACK packet, one reason code per requested filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, reason_codes: Vec<ReasonCode>) -> Self {
        Self {
            packet_id,
            reason_codes,
            properties: Properties::default(),
        }
    }
}

/// The QoS a SUBACK reason code grants, or `None` for a refusal
#[must_use]
pub fn granted_qos(code: ReasonCode) -> Option<QoS> {
    match code {
        GRANTED_QOS_0 => Some(QoS::AtMostOnce),
        ReasonCode::GrantedQoS1 => Some(QoS::AtLeastOnce),
        ReasonCode::GrantedQoS2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Body shared by SUBACK and UNSUBACK: id, properties, reason code list
pub(crate) fn encode_reason_list<B: BufMut>(
    buf: &mut B,
    packet_type: PacketType,
    packet_id: u16,
    reason_codes: &[ReasonCode],
    properties: &Properties,
) -> Result<()> {
    buf.put_u16(nonzero_packet_id(packet_id, packet_type)?);
    properties.encode_for(packet_type, buf)?;
    for code in reason_codes {
        buf.put_u8(u8::from(*code));
    }
    Ok(())
}

pub(crate) fn decode_reason_list<B: Buf>(
    buf: &mut B,
    packet_type: PacketType,
) -> Result<(u16, Vec<ReasonCode>, Properties)> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} missing packet identifier"
        )));
    }
    let packet_id = nonzero_packet_id(buf.get_u16(), packet_type)?;
    let properties = Properties::decode_for(packet_type, buf)?;
    let mut reason_codes = Vec::with_capacity(buf.remaining());
    while buf.has_remaining() {
        reason_codes.push(decode_reason_code(buf.get_u8(), packet_type)?);
    }
    if reason_codes.is_empty() {
        return Err(MqttError::ProtocolError(format!(
            "{packet_type:?} carries no reason codes"
        )));
    }
    Ok((packet_id, reason_codes, properties))
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_reason_list(
            buf,
            PacketType::SubAck,
            self.packet_id,
            &self.reason_codes,
            &self.properties,
        )
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let (packet_id, reason_codes, properties) = decode_reason_list(buf, PacketType::SubAck)?;
        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}

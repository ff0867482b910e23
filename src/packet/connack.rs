use crate::error::{MqttError, Result};
use crate::flags::ConnAckFlags;
use crate::packet::{decode_reason_code, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use bytes::{Buf, BufMut};

/// MQTT v5.0 CONNACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, reason_code: ReasonCode) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, interval: u32) -> Self {
        self.properties.set_session_expiry_interval(interval);
        self
    }

    #[must_use]
    pub fn with_receive_maximum(mut self, max: u16) -> Self {
        self.properties.set_receive_maximum(max);
        self
    }

    #[must_use]
    pub fn with_assigned_client_id(mut self, id: impl Into<String>) -> Self {
        self.properties.set_assigned_client_identifier(id.into());
        self
    }

    #[must_use]
    pub fn with_server_keep_alive(mut self, seconds: u16) -> Self {
        self.properties.set_server_keep_alive(seconds);
        self
    }

    #[must_use]
    pub fn with_maximum_packet_size(mut self, size: u32) -> Self {
        self.properties.set_maximum_packet_size(size);
        self
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let flags = if self.session_present {
            ConnAckFlags::SessionPresent as u8
        } else {
            0
        };
        buf.put_u8(flags);
        buf.put_u8(u8::from(self.reason_code));
        self.properties.encode_for(PacketType::ConnAck, buf)
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK missing flags or reason code".to_string(),
            ));
        }
        let flags = buf.get_u8();
        if flags & !(ConnAckFlags::SessionPresent as u8) != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNACK reserved flag bits must be 0".to_string(),
            ));
        }
        let session_present = ConnAckFlags::decompose(flags).contains(&ConnAckFlags::SessionPresent);
        let reason_code = decode_reason_code(buf.get_u8(), PacketType::ConnAck)?;
        if session_present && reason_code != ReasonCode::Success {
            return Err(MqttError::ProtocolError(
                "CONNACK rejected the connection but set session present".to_string(),
            ));
        }

        let properties = if buf.has_remaining() {
            Properties::decode_for(PacketType::ConnAck, buf)?
        } else {
            Properties::default()
        };

        Ok(Self {
            session_present,
            reason_code,
            properties,
        })
    }
}

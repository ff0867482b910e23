use crate::error::Result;
use crate::packet::{decode_reason_code, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::{ReasonCode, NORMAL_DISCONNECTION};
use bytes::{Buf, BufMut};

/// MQTT v5.0 DISCONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl DisconnectPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_DISCONNECTION)
    }

    /// Replaces the session expiry interval for this disconnect only
    #[must_use]
    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_session_expiry_interval(seconds);
        self
    }

    #[must_use]
    pub fn with_reason_string(mut self, reason: String) -> Self {
        self.properties.set_reason_string(reason);
        self
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let has_properties = self.properties.encoded_len_for(PacketType::Disconnect) > 1;
        if self.reason_code == NORMAL_DISCONNECTION && !has_properties {
            return Ok(());
        }
        buf.put_u8(u8::from(self.reason_code));
        if has_properties {
            self.properties.encode_for(PacketType::Disconnect, buf)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if !buf.has_remaining() {
            return Ok(Self::normal());
        }
        let reason_code = decode_reason_code(buf.get_u8(), PacketType::Disconnect)?;
        let properties = if buf.has_remaining() {
            Properties::decode_for(PacketType::Disconnect, buf)?
        } else {
            Properties::default()
        };
        Ok(Self {
            reason_code,
            properties,
        })
    }
}

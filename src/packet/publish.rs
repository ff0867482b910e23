use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::PublishFlags;
use crate::packet::{nonzero_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// MQTT v5.0 PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present exactly when `qos` is above 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
}

impl PublishPacket {
    /// Creates a QoS 0 PUBLISH
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            properties: Properties::default(),
        }
    }

    /// Sets the QoS together with the packet identifier it requires
    #[must_use]
    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = (qos != QoS::AtMostOnce).then_some(packet_id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_message_expiry_interval(seconds);
        self
    }

    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.properties.message_expiry_interval()
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = PublishFlags::with_qos(0, self.qos as u8);
        if self.dup {
            flags |= PublishFlags::Dup as u8;
        }
        if self.retain {
            flags |= PublishFlags::Retain as u8;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic_name)?;
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtMostOnce, Some(_)) => {
                return Err(MqttError::ProtocolError(
                    "QoS 0 PUBLISH must not carry a packet identifier".to_string(),
                ));
            }
            (_, Some(packet_id)) => {
                buf.put_u16(nonzero_packet_id(packet_id, PacketType::Publish)?);
            }
            (_, None) => {
                return Err(MqttError::ProtocolError(
                    "Packet identifier required for QoS > 0".to_string(),
                ));
            }
        }
        self.properties.encode_for(PacketType::Publish, buf)?;
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        let flags = PublishFlags::decompose(fixed_header.flags);
        let dup = flags.contains(&PublishFlags::Dup);
        let retain = flags.contains(&PublishFlags::Retain);
        let qos_val = PublishFlags::extract_qos(fixed_header.flags);
        let qos = QoS::try_from(qos_val)
            .map_err(|_| MqttError::MalformedPacket(format!("PUBLISH with QoS {qos_val}")))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(MqttError::MalformedPacket(
                "DUP flag set on QoS 0 PUBLISH".to_string(),
            ));
        }

        let topic_name = decode_string(buf)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::MalformedPacket(
                    "Missing packet identifier".to_string(),
                ));
            }
            Some(nonzero_packet_id(buf.get_u16(), PacketType::Publish)?)
        };
        let properties = Properties::decode_for(PacketType::Publish, buf)?;
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain,
            dup,
            properties,
        })
    }
}

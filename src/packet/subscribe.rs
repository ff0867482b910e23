use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{nonzero_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::QoS;
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// Per-filter subscription options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    /// Highest QoS the server may use when forwarding to us
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendAtSubscribeIfNew = 1,
    DoNotSend = 2,
}

/// Subscription options byte, bits 7-0
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct SubscriptionOptionsBits {
    /// Must be 0
    #[bits(2)]
    pub reserved_bits: u8,
    #[bits(2)]
    pub retain_handling: u8,
    #[bits(1)]
    pub retain_as_published: u8,
    #[bits(1)]
    pub no_local: u8,
    #[bits(2)]
    pub qos: u8,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn encode(&self) -> u8 {
        let bits = SubscriptionOptionsBits {
            reserved_bits: 0,
            retain_handling: self.retain_handling as u8,
            retain_as_published: u8::from(self.retain_as_published),
            no_local: u8::from(self.no_local),
            qos: self.qos as u8,
        };
        bits.to_be_bytes()[0]
    }

    /// # Errors
    ///
    /// Returns `MalformedPacket` for reserved bits, QoS 3 or retain handling 3
    pub fn decode(byte: u8) -> Result<Self> {
        let (bits, _) = SubscriptionOptionsBits::try_from_be_bytes(&[byte]).map_err(|e| {
            MqttError::MalformedPacket(format!("Invalid subscription options: {e:?}"))
        })?;
        if bits.reserved_bits != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved bits in subscription options must be 0".to_string(),
            ));
        }
        let qos = QoS::try_from(bits.qos).map_err(|_| {
            MqttError::MalformedPacket(format!("Invalid QoS in subscription options: {}", bits.qos))
        })?;
        let retain_handling = match bits.retain_handling {
            0 => RetainHandling::SendAtSubscribe,
            1 => RetainHandling::SendAtSubscribeIfNew,
            2 => RetainHandling::DoNotSend,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid retain handling value: {other}"
                )))
            }
        };
        Ok(Self {
            qos,
            no_local: bits.no_local != 0,
            retain_as_published: bits.retain_as_published != 0,
            retain_handling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions::new(qos),
        }
    }
}

/// MQTT v5.0 SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
    pub properties: Properties,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, filters: Vec<TopicFilter>) -> Self {
        Self {
            packet_id,
            filters,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn with_subscription_identifier(mut self, id: u32) -> Self {
        self.properties.set_subscription_identifier(id);
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(nonzero_packet_id(self.packet_id, PacketType::Subscribe)?);
        self.properties.encode_for(PacketType::Subscribe, buf)?;
        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.options.encode());
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE missing packet identifier".to_string(),
            ));
        }
        let packet_id = nonzero_packet_id(buf.get_u16(), PacketType::Subscribe)?;
        let properties = Properties::decode_for(PacketType::Subscribe, buf)?;

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Missing subscription options".to_string(),
                ));
            }
            let options = SubscriptionOptions::decode(buf.get_u8())?;
            filters.push(TopicFilter { filter, options });
        }
        if filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_subscription_options_byte() {
        let options = SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            no_local: true,
            retain_as_published: true,
            retain_handling: RetainHandling::DoNotSend,
        };
        assert_eq!(options.encode(), 0b0010_1110);
        assert_eq!(SubscriptionOptions::decode(0b0010_1110).unwrap(), options);
        assert!(SubscriptionOptions::decode(0b0100_0000).is_err());
        assert!(SubscriptionOptions::decode(0b0000_0011).is_err());
        assert!(SubscriptionOptions::decode(0b0011_0000).is_err());
    }

    #[test]
    fn test_subscribe_round_trip() {
        let packet = SubscribePacket::new(
            3,
            vec![
                TopicFilter::new("x/demo", QoS::ExactlyOnce),
                TopicFilter::new("sensors/+/temp", QoS::AtMostOnce),
            ],
        )
        .with_subscription_identifier(17);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x82);

        let mut body = buf.split_off(2);
        let header = FixedHeader::new(PacketType::Subscribe, 0x02, u32::try_from(body.len()).unwrap());
        assert_eq!(SubscribePacket::decode_body(&mut body, &header).unwrap(), packet);
    }

    #[test]
    fn test_subscribe_requires_filters() {
        let packet = SubscribePacket::new(1, vec![]);
        assert!(matches!(
            packet.encode_body(&mut BytesMut::new()),
            Err(MqttError::ProtocolError(_))
        ));
    }
}

use crate::encoding::{
    binary_len, decode_binary, decode_string, decode_variable_int, encode_binary, encode_string,
    encode_variable_int, string_len, variable_int_len,
};
use crate::error::{MqttError, Result};
use crate::packet::PacketType;
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;

/// MQTT v5.0 Property Identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    // Byte properties
    PayloadFormatIndicator = 0x01,
    RequestProblemInformation = 0x17,
    RequestResponseInformation = 0x19,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,

    // Two Byte Integer properties
    ServerKeepAlive = 0x13,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,

    // Four Byte Integer properties
    MessageExpiryInterval = 0x02,
    SessionExpiryInterval = 0x11,
    WillDelayInterval = 0x18,
    MaximumPacketSize = 0x27,

    // Variable Byte Integer properties
    SubscriptionIdentifier = 0x0B,

    // UTF-8 Encoded String properties
    ContentType = 0x03,
    ResponseTopic = 0x08,
    AssignedClientIdentifier = 0x12,
    AuthenticationMethod = 0x15,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,

    // Binary Data properties
    CorrelationData = 0x09,
    AuthenticationData = 0x16,

    // UTF-8 String Pair properties
    UserProperty = 0x26,
}

/// Where a property block appears
///
/// Will properties travel inside CONNECT but follow their own allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyContext {
    Packet(PacketType),
    Will,
}

impl From<PacketType> for PropertyContext {
    fn from(packet_type: PacketType) -> Self {
        Self::Packet(packet_type)
    }
}

impl PropertyId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::PayloadFormatIndicator),
            0x02 => Some(Self::MessageExpiryInterval),
            0x03 => Some(Self::ContentType),
            0x08 => Some(Self::ResponseTopic),
            0x09 => Some(Self::CorrelationData),
            0x0B => Some(Self::SubscriptionIdentifier),
            0x11 => Some(Self::SessionExpiryInterval),
            0x12 => Some(Self::AssignedClientIdentifier),
            0x13 => Some(Self::ServerKeepAlive),
            0x15 => Some(Self::AuthenticationMethod),
            0x16 => Some(Self::AuthenticationData),
            0x17 => Some(Self::RequestProblemInformation),
            0x18 => Some(Self::WillDelayInterval),
            0x19 => Some(Self::RequestResponseInformation),
            0x1A => Some(Self::ResponseInformation),
            0x1C => Some(Self::ServerReference),
            0x1F => Some(Self::ReasonString),
            0x21 => Some(Self::ReceiveMaximum),
            0x22 => Some(Self::TopicAliasMaximum),
            0x23 => Some(Self::TopicAlias),
            0x24 => Some(Self::MaximumQoS),
            0x25 => Some(Self::RetainAvailable),
            0x26 => Some(Self::UserProperty),
            0x27 => Some(Self::MaximumPacketSize),
            0x28 => Some(Self::WildcardSubscriptionAvailable),
            0x29 => Some(Self::SubscriptionIdentifierAvailable),
            0x2A => Some(Self::SharedSubscriptionAvailable),
            _ => None,
        }
    }

    /// Checks if this property can appear multiple times in a packet
    #[must_use]
    pub fn allows_multiple(&self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }

    /// Gets the expected value type for this property
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::PayloadFormatIndicator
            | Self::RequestProblemInformation
            | Self::RequestResponseInformation
            | Self::MaximumQoS
            | Self::RetainAvailable
            | Self::WildcardSubscriptionAvailable
            | Self::SubscriptionIdentifierAvailable
            | Self::SharedSubscriptionAvailable => PropertyValueType::Byte,

            Self::ServerKeepAlive
            | Self::ReceiveMaximum
            | Self::TopicAliasMaximum
            | Self::TopicAlias => PropertyValueType::TwoByteInteger,

            Self::MessageExpiryInterval
            | Self::SessionExpiryInterval
            | Self::WillDelayInterval
            | Self::MaximumPacketSize => PropertyValueType::FourByteInteger,

            Self::SubscriptionIdentifier => PropertyValueType::VariableByteInteger,

            Self::ContentType
            | Self::ResponseTopic
            | Self::AssignedClientIdentifier
            | Self::AuthenticationMethod
            | Self::ResponseInformation
            | Self::ServerReference
            | Self::ReasonString => PropertyValueType::Utf8String,

            Self::CorrelationData | Self::AuthenticationData => PropertyValueType::BinaryData,

            Self::UserProperty => PropertyValueType::Utf8StringPair,
        }
    }

    /// Allow-list check: may this property appear in `context`?
    #[must_use]
    pub fn is_valid_for(&self, context: impl Into<PropertyContext>) -> bool {
        use PacketType as P;

        let packet_type = match context.into() {
            PropertyContext::Will => {
                return matches!(
                    self,
                    Self::PayloadFormatIndicator
                        | Self::MessageExpiryInterval
                        | Self::ContentType
                        | Self::ResponseTopic
                        | Self::CorrelationData
                        | Self::WillDelayInterval
                        | Self::UserProperty
                );
            }
            PropertyContext::Packet(packet_type) => packet_type,
        };

        match self {
            Self::PayloadFormatIndicator
            | Self::MessageExpiryInterval
            | Self::ContentType
            | Self::ResponseTopic
            | Self::CorrelationData
            | Self::TopicAlias => packet_type == P::Publish,
            Self::SubscriptionIdentifier => matches!(packet_type, P::Publish | P::Subscribe),
            Self::SessionExpiryInterval => {
                matches!(packet_type, P::Connect | P::ConnAck | P::Disconnect)
            }
            Self::AuthenticationMethod | Self::AuthenticationData => {
                matches!(packet_type, P::Connect | P::ConnAck | P::Auth)
            }
            Self::RequestProblemInformation | Self::RequestResponseInformation => {
                packet_type == P::Connect
            }
            Self::ReceiveMaximum | Self::TopicAliasMaximum | Self::MaximumPacketSize => {
                matches!(packet_type, P::Connect | P::ConnAck)
            }
            Self::AssignedClientIdentifier
            | Self::ServerKeepAlive
            | Self::ResponseInformation
            | Self::MaximumQoS
            | Self::RetainAvailable
            | Self::WildcardSubscriptionAvailable
            | Self::SubscriptionIdentifierAvailable
            | Self::SharedSubscriptionAvailable => packet_type == P::ConnAck,
            Self::ServerReference => matches!(packet_type, P::ConnAck | P::Disconnect),
            Self::WillDelayInterval => false,
            Self::ReasonString => matches!(
                packet_type,
                P::ConnAck
                    | P::PubAck
                    | P::PubRec
                    | P::PubRel
                    | P::PubComp
                    | P::SubAck
                    | P::UnsubAck
                    | P::Disconnect
                    | P::Auth
            ),
            Self::UserProperty => !matches!(packet_type, P::PingReq | P::PingResp),
        }
    }
}

/// Property value types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValueType {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    BinaryData,
    Utf8String,
    Utf8StringPair,
}

/// Property value storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInteger(u16),
    FourByteInteger(u32),
    VariableByteInteger(u32),
    BinaryData(Bytes),
    Utf8String(String),
    Utf8StringPair(String, String),
}

impl PropertyValue {
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::Byte(_) => PropertyValueType::Byte,
            Self::TwoByteInteger(_) => PropertyValueType::TwoByteInteger,
            Self::FourByteInteger(_) => PropertyValueType::FourByteInteger,
            Self::VariableByteInteger(_) => PropertyValueType::VariableByteInteger,
            Self::BinaryData(_) => PropertyValueType::BinaryData,
            Self::Utf8String(_) => PropertyValueType::Utf8String,
            Self::Utf8StringPair(_, _) => PropertyValueType::Utf8StringPair,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::TwoByteInteger(_) => 2,
            Self::FourByteInteger(_) => 4,
            Self::VariableByteInteger(v) => variable_int_len(*v),
            Self::BinaryData(v) => binary_len(v),
            Self::Utf8String(v) => string_len(v),
            Self::Utf8StringPair(k, v) => string_len(k) + string_len(v),
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Byte(v) => buf.put_u8(*v),
            Self::TwoByteInteger(v) => buf.put_u16(*v),
            Self::FourByteInteger(v) => buf.put_u32(*v),
            Self::VariableByteInteger(v) => encode_variable_int(buf, *v)?,
            Self::BinaryData(v) => encode_binary(buf, v)?,
            Self::Utf8String(v) => encode_string(buf, v)?,
            Self::Utf8StringPair(k, v) => {
                encode_string(buf, k)?;
                encode_string(buf, v)?;
            }
        }
        Ok(())
    }

    fn decode<B: Buf>(value_type: PropertyValueType, buf: &mut B) -> Result<Self> {
        let need = |n: usize, buf: &B| {
            if buf.remaining() < n {
                Err(MqttError::MalformedPacket(format!(
                    "Insufficient data for {value_type:?} property"
                )))
            } else {
                Ok(())
            }
        };

        Ok(match value_type {
            PropertyValueType::Byte => {
                need(1, buf)?;
                Self::Byte(buf.get_u8())
            }
            PropertyValueType::TwoByteInteger => {
                need(2, buf)?;
                Self::TwoByteInteger(buf.get_u16())
            }
            PropertyValueType::FourByteInteger => {
                need(4, buf)?;
                Self::FourByteInteger(buf.get_u32())
            }
            PropertyValueType::VariableByteInteger => {
                Self::VariableByteInteger(decode_variable_int(buf)?)
            }
            PropertyValueType::BinaryData => Self::BinaryData(decode_binary(buf)?),
            PropertyValueType::Utf8String => Self::Utf8String(decode_string(buf)?),
            PropertyValueType::Utf8StringPair => {
                let key = decode_string(buf)?;
                let value = decode_string(buf)?;
                Self::Utf8StringPair(key, value)
            }
        })
    }
}

/// Container for MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    properties: HashMap<PropertyId, Vec<PropertyValue>>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the value type doesn't match the property,
    /// or if the property is single-valued and already present
    pub fn add(&mut self, id: PropertyId, value: PropertyValue) -> Result<()> {
        if value.value_type() != id.value_type() {
            return Err(MqttError::ProtocolError(format!(
                "Property {id:?} expects type {:?}, got {:?}",
                id.value_type(),
                value.value_type()
            )));
        }
        if !id.allows_multiple() && self.properties.contains_key(&id) {
            return Err(MqttError::ProtocolError(format!(
                "Duplicate property {id:?} (0x{:02X})",
                id as u8
            )));
        }
        self.properties.entry(id).or_default().push(value);
        Ok(())
    }

    /// Replaces every value of `id` with `value`
    fn set(&mut self, id: PropertyId, value: PropertyValue) {
        self.properties.insert(id, vec![value]);
    }

    pub fn remove(&mut self, id: PropertyId) -> Option<Vec<PropertyValue>> {
        self.properties.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(&id).and_then(|v| v.first())
    }

    #[must_use]
    pub fn get_all(&self, id: PropertyId) -> Option<&[PropertyValue]> {
        self.properties.get(&id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, id: PropertyId) -> bool {
        self.properties.contains_key(&id)
    }

    /// Number of distinct property identifiers present
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> + '_ {
        self.properties
            .iter()
            .flat_map(|(id, values)| values.iter().map(move |value| (*id, value)))
    }

    /// Checks every present property against the allow-list for `context`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` naming the first disallowed property
    pub fn validate_for(&self, context: impl Into<PropertyContext>) -> Result<()> {
        let context = context.into();
        match self.properties.keys().find(|id| !id.is_valid_for(context)) {
            Some(id) => Err(MqttError::ProtocolError(format!(
                "Property {id:?} is not allowed in {context:?}"
            ))),
            None => Ok(()),
        }
    }

    /// Sorted (id, values) pairs that are allowed in `context`
    fn allowed(&self, context: PropertyContext) -> Vec<(PropertyId, &Vec<PropertyValue>)> {
        let mut allowed: Vec<_> = self
            .properties
            .iter()
            .filter(|(id, _)| {
                let keep = id.is_valid_for(context);
                if !keep {
                    tracing::trace!(property = ?id, ?context, "Omitting property not valid here");
                }
                keep
            })
            .map(|(id, values)| (*id, values))
            .collect();
        allowed.sort_by_key(|(id, _)| *id as u8);
        allowed
    }

    /// Encodes the length-prefixed property block for `context`,
    /// silently omitting properties the allow-list rejects
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encoded
    pub fn encode_for<B: BufMut>(
        &self,
        context: impl Into<PropertyContext>,
        buf: &mut B,
    ) -> Result<()> {
        let allowed = self.allowed(context.into());
        let body_len: usize = allowed
            .iter()
            .flat_map(|(_, values)| values.iter())
            .map(|value| 1 + value.encoded_len())
            .sum();

        encode_variable_int(
            buf,
            u32::try_from(body_len).map_err(|_| MqttError::PacketTooLarge {
                size: body_len,
                max: crate::encoding::VARIABLE_INT_MAX as usize,
            })?,
        )?;
        for (id, values) in allowed {
            for value in values {
                buf.put_u8(id as u8);
                value.encode(buf)?;
            }
        }
        Ok(())
    }

    /// Encoded length of the property block for `context`, including its length prefix
    #[must_use]
    pub fn encoded_len_for(&self, context: impl Into<PropertyContext>) -> usize {
        let context = context.into();
        let body_len: usize = self
            .iter()
            .filter(|(id, _)| id.is_valid_for(context))
            .map(|(_, value)| 1 + value.encoded_len())
            .sum();
        variable_int_len(u32::try_from(body_len).unwrap_or(u32::MAX)) + body_len
    }

    /// Decodes a length-prefixed property block found in `context`
    ///
    /// # Errors
    ///
    /// - `MalformedPacket` if the block is truncated
    /// - `ProtocolError` on an unknown identifier, a property not allowed in
    ///   `context`, a duplicate single-valued property
    pub fn decode_for<B: Buf>(context: impl Into<PropertyContext>, buf: &mut B) -> Result<Self> {
        let context = context.into();
        let props_len = decode_variable_int(buf)? as usize;
        if buf.remaining() < props_len {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for properties: expected {props_len}, got {}",
                buf.remaining()
            )));
        }

        let mut props_buf = buf.copy_to_bytes(props_len);
        let mut properties = Self::new();

        while props_buf.has_remaining() {
            let raw_id = decode_variable_int(&mut props_buf)?;
            let id = u8::try_from(raw_id)
                .ok()
                .and_then(PropertyId::from_u8)
                .ok_or_else(|| {
                    MqttError::ProtocolError(format!("Unknown property identifier 0x{raw_id:02X}"))
                })?;
            if !id.is_valid_for(context) {
                return Err(MqttError::ProtocolError(format!(
                    "Property {id:?} is not allowed in {context:?}"
                )));
            }
            let value = PropertyValue::decode(id.value_type(), &mut props_buf)?;
            properties.add(id, value)?;
        }

        Ok(properties)
    }

    // Typed setters replace any existing value

    /// Sets the payload format indicator (0 = unspecified bytes, 1 = UTF-8)
    pub fn set_payload_format_indicator(&mut self, is_utf8: bool) {
        self.set(
            PropertyId::PayloadFormatIndicator,
            PropertyValue::Byte(u8::from(is_utf8)),
        );
    }

    pub fn set_message_expiry_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::MessageExpiryInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    pub fn set_content_type(&mut self, content_type: String) {
        self.set(PropertyId::ContentType, PropertyValue::Utf8String(content_type));
    }

    pub fn set_response_topic(&mut self, topic: String) {
        self.set(PropertyId::ResponseTopic, PropertyValue::Utf8String(topic));
    }

    pub fn set_correlation_data(&mut self, data: Bytes) {
        self.set(PropertyId::CorrelationData, PropertyValue::BinaryData(data));
    }

    /// Adds a user property (can be called multiple times)
    pub fn add_user_property(&mut self, key: String, value: String) {
        self.properties
            .entry(PropertyId::UserProperty)
            .or_default()
            .push(PropertyValue::Utf8StringPair(key, value));
    }

    pub fn set_subscription_identifier(&mut self, id: u32) {
        self.set(
            PropertyId::SubscriptionIdentifier,
            PropertyValue::VariableByteInteger(id),
        );
    }

    pub fn set_session_expiry_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::SessionExpiryInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    pub fn set_assigned_client_identifier(&mut self, id: String) {
        self.set(
            PropertyId::AssignedClientIdentifier,
            PropertyValue::Utf8String(id),
        );
    }

    pub fn set_server_keep_alive(&mut self, seconds: u16) {
        self.set(
            PropertyId::ServerKeepAlive,
            PropertyValue::TwoByteInteger(seconds),
        );
    }

    pub fn set_receive_maximum(&mut self, max: u16) {
        self.set(PropertyId::ReceiveMaximum, PropertyValue::TwoByteInteger(max));
    }

    pub fn set_topic_alias(&mut self, alias: u16) {
        self.set(PropertyId::TopicAlias, PropertyValue::TwoByteInteger(alias));
    }

    pub fn set_maximum_packet_size(&mut self, size: u32) {
        self.set(
            PropertyId::MaximumPacketSize,
            PropertyValue::FourByteInteger(size),
        );
    }

    pub fn set_will_delay_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::WillDelayInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    pub fn set_reason_string(&mut self, reason: String) {
        self.set(PropertyId::ReasonString, PropertyValue::Utf8String(reason));
    }

    pub fn set_server_reference(&mut self, reference: String) {
        self.set(
            PropertyId::ServerReference,
            PropertyValue::Utf8String(reference),
        );
    }

    // Typed getters

    fn get_u8(&self, id: PropertyId) -> Option<u8> {
        match self.get(id) {
            Some(PropertyValue::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_u16(&self, id: PropertyId) -> Option<u16> {
        match self.get(id) {
            Some(PropertyValue::TwoByteInteger(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_u32(&self, id: PropertyId) -> Option<u32> {
        match self.get(id) {
            Some(PropertyValue::FourByteInteger(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_str(&self, id: PropertyId) -> Option<&str> {
        match self.get(id) {
            Some(PropertyValue::Utf8String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn payload_format_indicator(&self) -> Option<bool> {
        self.get_u8(PropertyId::PayloadFormatIndicator)
            .map(|v| v == 1)
    }

    /// Message expiry interval in seconds; `None` means the message never expires
    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::MessageExpiryInterval)
    }

    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::SessionExpiryInterval)
    }

    #[must_use]
    pub fn will_delay_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::WillDelayInterval)
    }

    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.get_str(PropertyId::AssignedClientIdentifier)
    }

    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        self.get_u16(PropertyId::ServerKeepAlive)
    }

    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        self.get_u16(PropertyId::ReceiveMaximum)
    }

    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.get_u32(PropertyId::MaximumPacketSize)
    }

    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        self.get_u16(PropertyId::TopicAlias)
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get_str(PropertyId::ContentType)
    }

    #[must_use]
    pub fn response_topic(&self) -> Option<&str> {
        self.get_str(PropertyId::ResponseTopic)
    }

    #[must_use]
    pub fn reason_string(&self) -> Option<&str> {
        self.get_str(PropertyId::ReasonString)
    }

    #[must_use]
    pub fn correlation_data(&self) -> Option<&Bytes> {
        match self.get(PropertyId::CorrelationData) {
            Some(PropertyValue::BinaryData(v)) => Some(v),
            _ => None,
        }
    }

    pub fn subscription_identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.get_all(PropertyId::SubscriptionIdentifier)
            .unwrap_or_default()
            .iter()
            .filter_map(|value| match value {
                PropertyValue::VariableByteInteger(v) => Some(*v),
                _ => None,
            })
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.get_all(PropertyId::UserProperty)
            .unwrap_or_default()
            .iter()
            .filter_map(|value| match value {
                PropertyValue::Utf8StringPair(k, v) => Some((k.as_str(), v.as_str())),
                _ => None,
            })
    }
}

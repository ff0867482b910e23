use crate::constants::defaults;
use crate::packet::connect::LastWill;
use crate::packet::publish::PublishPacket;
use crate::protocol::v5::properties::Properties;
use crate::QoS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::protocol::v5::reason_codes::ReasonCode;

/// Outcome of a successful CONNECT exchange
///
/// A broker refusal is reported here too: `reason_code` carries the CONNACK
/// code and the session ends up in `ConnectFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    /// Whether the broker resumed a previous session
    pub session_present: bool,
    pub assigned_client_id: Option<String>,
    pub reason_code: ReasonCode,
}

impl ConnectResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason_code == ReasonCode::Success
    }
}

/// Outcome of a publish
///
/// # Examples
///
/// ```
/// use mqtt5_session::{PublishOutcome, ReasonCode};
///
/// let outcome = PublishOutcome { packet_id: Some(42), reason_code: ReasonCode::NoMatchingSubscribers };
/// assert!(!outcome.is_error());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// `None` for QoS 0
    pub packet_id: Option<u16>,
    /// Code from PUBACK or PUBREC; `Success` for QoS 0
    pub reason_code: ReasonCode,
}

impl PublishOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.reason_code.is_error()
    }
}

/// Per-operation wait limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimeouts {
    /// Wait for CONNACK; expiry fails the connection
    pub connack: Duration,
    /// Wait for PUBACK or PUBCOMP; `None` waits as long as the broker takes
    pub ack: Option<Duration>,
    /// Wait for SUBACK or UNSUBACK; expiry is reported but the connection stays up
    pub subscribe: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connack: defaults::CONNACK_TIMEOUT,
            ack: None,
            subscribe: defaults::SUBSCRIBE_TIMEOUT,
        }
    }
}

/// Connection options
///
/// # Examples
///
/// ```
/// use mqtt5_session::{ConnectOptions, WillMessage, QoS};
/// use std::time::Duration;
///
/// let options = ConnectOptions::new("sensor-7")
///     .with_clean_start(false)
///     .with_session_expiry_interval(300)
///     .with_keep_alive(Duration::from_secs(30));
///
/// let will = WillMessage::new("status/sensor-7", b"offline".to_vec())
///     .with_qos(QoS::AtLeastOnce)
///     .with_retain(true);
/// let options = options.with_will(will).with_credentials("user", b"secret".to_vec());
/// assert!(options.will.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Empty asks the broker to assign one (requires `clean_start`)
    pub client_id: String,
    pub clean_start: bool,
    /// Zero disables keep-alive
    pub keep_alive: Duration,
    /// `None` sends no property, which the broker reads as 0
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,
    pub user_properties: Vec<(String, String)>,
    pub timeouts: SessionTimeouts,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_start: true,
            keep_alive: defaults::KEEP_ALIVE,
            session_expiry_interval: None,
            receive_maximum: None,
            maximum_packet_size: None,
            username: None,
            password: None,
            will: None,
            user_properties: Vec::new(),
            timeouts: SessionTimeouts::default(),
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    #[must_use]
    pub fn with_maximum_packet_size(mut self, size: u32) -> Self {
        self.maximum_packet_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Keep-alive as the whole seconds carried in CONNECT
    #[must_use]
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }
}

/// Will message published by the broker if the connection drops abnormally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: Option<u32>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl WillMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            delay_interval: None,
            message_expiry_interval: None,
            content_type: None,
            user_properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_delay_interval(mut self, seconds: u32) -> Self {
        self.delay_interval = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.message_expiry_interval = Some(seconds);
        self
    }

    pub(crate) fn to_last_will(&self) -> LastWill {
        let mut properties = Properties::new();
        if let Some(seconds) = self.delay_interval {
            properties.set_will_delay_interval(seconds);
        }
        if let Some(seconds) = self.message_expiry_interval {
            properties.set_message_expiry_interval(seconds);
        }
        if let Some(content_type) = &self.content_type {
            properties.set_content_type(content_type.clone());
        }
        for (key, value) in &self.user_properties {
            properties.add_user_property(key.clone(), value.clone());
        }
        LastWill {
            topic: self.topic.clone(),
            payload: Bytes::from(self.payload.clone()),
            qos: self.qos,
            retain: self.retain,
            properties,
        }
    }
}

/// Per-message publish options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    /// Seconds until the message must be discarded if undelivered
    pub message_expiry_interval: Option<u32>,
    pub payload_format_indicator: Option<bool>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl PublishOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_message_expiry_interval(mut self, seconds: u32) -> Self {
        self.message_expiry_interval = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_response_topic(mut self, topic: impl Into<String>) -> Self {
        self.response_topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_correlation_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.correlation_data = Some(data.into());
        self
    }

    #[must_use]
    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub(crate) fn to_properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(is_utf8) = self.payload_format_indicator {
            properties.set_payload_format_indicator(is_utf8);
        }
        if let Some(seconds) = self.message_expiry_interval {
            properties.set_message_expiry_interval(seconds);
        }
        if let Some(content_type) = &self.content_type {
            properties.set_content_type(content_type.clone());
        }
        if let Some(topic) = &self.response_topic {
            properties.set_response_topic(topic.clone());
        }
        if let Some(data) = &self.correlation_data {
            properties.set_correlation_data(Bytes::from(data.clone()));
        }
        for (key, value) in &self.user_properties {
            properties.add_user_property(key.clone(), value.clone());
        }
        properties
    }
}

/// Application message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl Message {
    /// Remaining expiry as received, if the broker set one
    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.properties.message_expiry_interval()
    }
}

impl From<PublishPacket> for Message {
    fn from(publish: PublishPacket) -> Self {
        Self {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties,
        }
    }
}

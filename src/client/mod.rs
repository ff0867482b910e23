//! Application-facing MQTT v5.0 session
//!
//! [`MqttSession`] owns one logical session. Each call to
//! [`MqttSession::connect`] attaches a fresh transport; delivery state
//! survives across connections when the session expiry interval allows it.

use crate::constants::defaults::MESSAGE_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::packet::subscribe::TopicFilter;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::session::ConnectionState;
use crate::transport::Transport;
use crate::types::{ConnectOptions, ConnectResult, Message, PublishOptions, PublishOutcome};
use crate::QoS;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::instrument;

mod direct;

use self::direct::Shared;

/// Handle to one MQTT v5.0 client session
///
/// Cloning yields another handle to the same session.
///
/// # Examples
///
/// ```rust,no_run
/// use mqtt5_session::{ConnectOptions, MqttSession, QoS};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (session, mut messages) = MqttSession::new(ConnectOptions::new("demo"));
///     let stream = tokio::net::TcpStream::connect("127.0.0.1:1883").await?;
///     session.connect(stream).await?;
///
///     let codes = session.subscribe(&[("x/demo", QoS::ExactlyOnce)]).await?;
///     println!("granted: {codes:?}");
///
///     session.publish("x/demo", b"hello".to_vec(), QoS::AtLeastOnce).await?;
///     let message = messages.recv().await;
///     println!("{message:?}");
///
///     session.disconnect(None).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MqttSession {
    shared: Arc<Shared>,
}

/// Inbound application messages, in arrival order
///
/// QoS 0 messages arrive immediately, QoS 1 after PUBACK is sent and QoS 2
/// after PUBCOMP is sent. Returns `None` once every session handle is gone.
///
/// The stream is bounded. While it is full the session stops reading from
/// the broker, so acknowledgments for outbound messages wait too.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::Receiver<Message>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Takes a message if one is already waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl MqttSession {
    #[must_use]
    pub fn new(options: ConnectOptions) -> (Self, MessageStream) {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let session = Self {
            shared: Arc::new(Shared::new(options, tx)),
        };
        (session, MessageStream { rx })
    }

    /// Sends CONNECT over `transport` and waits for CONNACK
    ///
    /// A refusal by the broker is not an error: the returned result carries
    /// the CONNACK reason code and the session moves to `ConnectFailed`.
    /// When the broker resumes the session, unfinished outbound handshakes are
    /// continued before this returns.
    ///
    /// # Errors
    ///
    /// - `AlreadyConnected` while a connection is open or being opened
    /// - `InvalidClientId` for an empty client id without clean start
    /// - `Timeout` if no CONNACK arrives within the configured wait
    /// - `ProtocolError` or `MalformedPacket` if the broker's reply is invalid
    /// - `Io` or `ConnectionLost` if the transport fails
    #[instrument(skip(self, transport), fields(client_id = %self.shared.options.client_id), level = "debug")]
    pub async fn connect<T: Transport>(&self, transport: T) -> Result<ConnectResult> {
        self.shared.connect(transport).await
    }

    /// Publishes with default options at the given QoS
    ///
    /// # Errors
    ///
    /// See [`Self::publish_with_options`]
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<PublishOutcome> {
        self.publish_with_options(topic, payload, PublishOptions::new(qos))
            .await
    }

    /// Publishes a message and waits for its handshake to finish
    ///
    /// QoS 0 returns once written. QoS 1 waits for PUBACK and QoS 2 for
    /// PUBCOMP. While the broker's receive maximum is reached or no packet
    /// identifier is free, the call waits for a slot.
    ///
    /// # Errors
    ///
    /// - `InvalidTopicName` for an empty or wildcard topic
    /// - `NotConnected` unless connected
    /// - `PacketTooLarge` if the packet exceeds the broker's maximum packet size
    /// - `Expired` if the message expiry interval passes before the handshake completes
    /// - `Timeout` if an acknowledgment wait is configured and exceeded
    /// - `ConnectionLost` if the connection closes while waiting
    #[instrument(skip(self, payload, options), fields(qos = ?options.qos), level = "debug")]
    pub async fn publish_with_options(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<PublishOutcome> {
        self.shared.publish(topic, payload.into(), options).await
    }

    /// Subscribes to `(filter, qos)` pairs
    ///
    /// Returns the broker's reason code for each filter, in order. Refusals are
    /// reported as codes, not errors.
    ///
    /// # Errors
    ///
    /// - `InvalidTopicFilter` for a malformed filter
    /// - `NotConnected` unless connected
    /// - `Timeout` if no SUBACK arrives in time; the connection stays up
    /// - `ConnectionLost` if the connection closes while waiting
    #[instrument(skip(self), level = "debug")]
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Vec<ReasonCode>> {
        let filters = filters
            .iter()
            .map(|(filter, qos)| TopicFilter::new(*filter, *qos))
            .collect();
        self.subscribe_with_options(filters).await
    }

    /// Subscribes with full subscription options per filter
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`]
    pub async fn subscribe_with_options(&self, filters: Vec<TopicFilter>) -> Result<Vec<ReasonCode>> {
        let suback = self.shared.subscribe(filters).await?;
        Ok(suback.reason_codes)
    }

    /// Unsubscribes from topic filters, returning one reason code per filter
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`]
    #[instrument(skip(self), level = "debug")]
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<Vec<ReasonCode>> {
        let filters = filters.iter().map(|filter| (*filter).to_string()).collect();
        let unsuback = self.shared.unsubscribe(filters).await?;
        Ok(unsuback.reason_codes)
    }

    /// Sends DISCONNECT and closes the transport
    ///
    /// `session_expiry` overrides how long the broker keeps the session;
    /// `Some(0)` ends it now.
    ///
    /// # Errors
    ///
    /// - `NotConnected` unless connected
    /// - `ProtocolError` for a non-zero override when the session was opened
    ///   with an expiry of 0; nothing is sent
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self, session_expiry: Option<u32>) -> Result<()> {
        self.shared.disconnect(session_expiry).await
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Client identifier in use, including one assigned by the broker
    pub async fn client_id(&self) -> String {
        self.shared.core.lock().await.machine.client_id().to_string()
    }

    /// Whether the last CONNACK resumed an existing session
    pub async fn session_present(&self) -> bool {
        self.shared.core.lock().await.machine.session_present()
    }

    /// Reason code of the last DISCONNECT sent by the broker
    pub async fn last_disconnect_reason(&self) -> Option<ReasonCode> {
        self.shared.core.lock().await.last_disconnect_reason
    }

    /// Outbound QoS 1 and QoS 2 messages not yet acknowledged
    pub async fn in_flight(&self) -> usize {
        self.shared
            .core
            .lock()
            .await
            .machine
            .tracker()
            .outbound_in_flight()
    }
}

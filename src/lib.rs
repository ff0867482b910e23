//! # MQTT v5.0 Client Session Engine
//!
//! Client-side session and delivery state machine for MQTT v5.0, with the
//! wire codec it needs to talk to a standards-compliant broker.
//!
//! The crate does not open sockets. A caller connects a byte stream (TCP, TLS,
//! an in-memory duplex) and hands it to [`MqttSession::connect`]; from then on
//! a background reader task decodes inbound packets and a keep-alive task
//! pings the broker while the link is idle. Application calls are plain
//! async methods.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt5_session::{ConnectOptions, MqttSession, PublishOptions, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConnectOptions::new("sensor-7")
//!         .with_clean_start(false)
//!         .with_session_expiry_interval(300);
//!     let (session, mut messages) = MqttSession::new(options);
//!
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:1883").await?;
//!     let result = session.connect(stream).await?;
//!     println!("session present: {}", result.session_present);
//!
//!     session.subscribe(&[("sensors/+/temp", QoS::ExactlyOnce)]).await?;
//!
//!     let options = PublishOptions::new(QoS::AtLeastOnce).with_message_expiry_interval(5);
//!     session
//!         .publish_with_options("sensors/7/temp", b"21.5".to_vec(), options)
//!         .await?;
//!
//!     if let Some(message) = messages.recv().await {
//!         println!("{} -> {:?}", message.topic, message.payload);
//!     }
//!
//!     session.disconnect(None).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod client;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod flags;
pub mod packet;
pub mod packet_id;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;
pub mod types;

pub use client::{MessageStream, MqttSession};
pub use error::{MqttError, Result};
pub use packet::codec::{decode_packet, encode_packet, encode_packet_into, Decoded};
pub use packet::publish::PublishPacket;
pub use packet::{FixedHeader, Packet, PacketType};
pub use packet_id::PacketIdPool;
pub use protocol::v5::properties::{Properties, PropertyId, PropertyValue};
pub use protocol::v5::reason_codes::ReasonCode;
pub use session::{ConnectionState, DeliveryTracker, SessionStateMachine};
pub use transport::Transport;
pub use types::{
    ConnectOptions, ConnectResult, Message, PublishOptions, PublishOutcome, SessionTimeouts,
    WillMessage,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

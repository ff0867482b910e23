use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors raised by the session engine
///
/// Broker acknowledgments that carry a failure reason code are not errors;
/// they are returned as data from the operation that caused them.
///
/// # Error Categories
///
/// - **Fatal to the connection**: `MalformedPacket`, `ProtocolError`, `ConnectionLost`, `KeepAliveTimeout`, `Io`
/// - **Per operation**: `Timeout`, `Expired`, `PacketTooLarge`
/// - **Local validation**: `InvalidTopicName`, `InvalidTopicFilter`, `InvalidClientId`, `InvalidQoS`
/// - **Lifecycle**: `NotConnected`, `AlreadyConnected`, `InvalidState`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Message expired before delivery completed (packet id {packet_id:?})")]
    Expired { packet_id: Option<u16> },

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid reason code: {0}")]
    InvalidReasonCode(u8),
}

impl MqttError {
    /// Returns true if the error must tear the connection down
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedPacket(_)
                | Self::ProtocolError(_)
                | Self::ConnectionLost
                | Self::KeepAliveTimeout
                | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MqttError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MqttError::ConnectionLost
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MqttError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MqttError::ConnectionLost
    }
}

impl From<tokio::time::error::Elapsed> for MqttError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MqttError::Timeout
    }
}

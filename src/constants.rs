//! Protocol constants and session defaults

use crate::packet::PacketType;

/// Fixed header byte 1 values that carry required flag bits
pub mod fixed_header {
    use super::PacketType;

    /// PUBREL, SUBSCRIBE and UNSUBSCRIBE must carry 0b0010 in the low nibble
    pub const REQUIRED_FLAGS: u8 = 0x02;

    #[must_use]
    pub const fn first_byte(packet_type: PacketType, flags: u8) -> u8 {
        ((packet_type as u8) << 4) | (flags & super::masks::FLAGS)
    }

    pub const PINGREQ: u8 = first_byte(PacketType::PingReq, 0);
    pub const PINGRESP: u8 = first_byte(PacketType::PingResp, 0);
}

/// Masks for extracting fields from fixed header
pub mod masks {
    pub const FLAGS: u8 = 0x0F;
    /// Variable byte integer continuation flag
    pub const CONTINUATION_BIT: u8 = 0x80;
    pub const VALUE_BITS: u8 = 0x7F;
}

/// CONNECT flags layout
pub mod connect_flags {
    pub const WILL_QOS_CLEAR_MASK: u8 = !0x18;
    pub const WILL_QOS_MASK: u8 = 0x03;
    pub const WILL_QOS_SHIFT: u8 = 3;
}

/// PUBLISH flags layout
pub mod publish_flags {
    pub const QOS_CLEAR_MASK: u8 = !0x06;
    pub const QOS_MASK: u8 = 0x03;
    pub const QOS_SHIFT: u8 = 1;
}

pub mod limits {
    pub const MAX_STRING_LENGTH: u16 = u16::MAX;

    /// Largest packet identifier; identifiers run 1..=65535
    pub const MAX_PACKET_ID: u16 = u16::MAX;
}

pub mod version {
    pub const PROTOCOL_NAME: &str = "MQTT";
    pub const MQTT_V5: u8 = 5;
}

/// Defaults for `ConnectOptions` and `SessionTimeouts`
pub mod defaults {
    use std::time::Duration;

    pub const KEEP_ALIVE: Duration = Duration::from_secs(60);
    pub const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Receive maximum when CONNACK does not carry one
    pub const RECEIVE_MAXIMUM: u16 = u16::MAX;

    /// Capacity of the inbound message channel
    pub const MESSAGE_CHANNEL_CAPACITY: usize = 256;

    /// Initial capacity of the transport read buffer
    pub const READ_BUFFER_SIZE: usize = 4096;
}

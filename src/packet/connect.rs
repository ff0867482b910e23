use crate::constants::version::{MQTT_V5, PROTOCOL_NAME};
use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::ConnectFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{Properties, PropertyContext};
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// Will message carried in the CONNECT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// MQTT v5.0 CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub clean_start: bool,
    /// Keep alive in seconds, 0 disables it
    pub keep_alive: u16,
    /// May be empty, asking the server to assign one
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
    pub properties: Properties,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            clean_start: true,
            keep_alive: 60,
            client_id: client_id.into(),
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_session_expiry_interval(seconds);
        self
    }

    /// Session expiry interval requested by this CONNECT; absent means 0
    #[must_use]
    pub fn session_expiry_interval(&self) -> u32 {
        self.properties.session_expiry_interval().unwrap_or(0)
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_start {
            flags |= ConnectFlags::CleanStart as u8;
        }
        if let Some(will) = &self.will {
            flags |= ConnectFlags::WillFlag as u8;
            flags = ConnectFlags::with_will_qos(flags, will.qos as u8);
            if will.retain {
                flags |= ConnectFlags::WillRetain as u8;
            }
        }
        if self.username.is_some() {
            flags |= ConnectFlags::UsernameFlag as u8;
        }
        if self.password.is_some() {
            flags |= ConnectFlags::PasswordFlag as u8;
        }
        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(MQTT_V5);
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);
        self.properties.encode_for(PacketType::Connect, buf)?;

        encode_string(buf, &self.client_id)?;
        if let Some(will) = &self.will {
            will.properties.encode_for(PropertyContext::Will, buf)?;
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let protocol_name = decode_string(buf)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(MqttError::ProtocolError(format!(
                "Invalid protocol name: {protocol_name}"
            )));
        }
        if buf.remaining() < 4 {
            return Err(MqttError::MalformedPacket(
                "CONNECT variable header truncated".to_string(),
            ));
        }
        let version = buf.get_u8();
        if version != MQTT_V5 {
            return Err(MqttError::ProtocolError(format!(
                "Unsupported protocol version {version}"
            )));
        }

        let flags = buf.get_u8();
        let decomposed = ConnectFlags::decompose(flags);
        if decomposed.contains(&ConnectFlags::Reserved) {
            return Err(MqttError::MalformedPacket(
                "CONNECT reserved flag is set".to_string(),
            ));
        }
        let will_flag = decomposed.contains(&ConnectFlags::WillFlag);
        let will_qos = ConnectFlags::extract_will_qos(flags);
        let will_retain = decomposed.contains(&ConnectFlags::WillRetain);
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(MqttError::MalformedPacket(
                "Will QoS/retain set without will flag".to_string(),
            ));
        }

        let keep_alive = buf.get_u16();
        let properties = Properties::decode_for(PacketType::Connect, buf)?;
        let client_id = decode_string(buf)?;

        let will = if will_flag {
            let properties = Properties::decode_for(PropertyContext::Will, buf)?;
            let topic = decode_string(buf)?;
            let payload = decode_binary(buf)?;
            Some(LastWill {
                topic,
                payload,
                qos: QoS::try_from(will_qos).map_err(|_| {
                    MqttError::MalformedPacket(format!("Invalid will QoS {will_qos}"))
                })?,
                retain: will_retain,
                properties,
            })
        } else {
            None
        };

        let username = if decomposed.contains(&ConnectFlags::UsernameFlag) {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if decomposed.contains(&ConnectFlags::PasswordFlag) {
            Some(decode_binary(buf)?)
        } else {
            None
        };

        Ok(Self {
            clean_start: decomposed.contains(&ConnectFlags::CleanStart),
            keep_alive,
            client_id,
            username,
            password,
            will,
            properties,
        })
    }
}

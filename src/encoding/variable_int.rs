//! Variable byte integer used for the remaining length and property lengths

use crate::constants::masks::{CONTINUATION_BIT, VALUE_BITS};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};
use std::fmt;

/// Maximum value that can be encoded as a variable byte integer (268,435,455)
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

/// Longest legal encoding in bytes
pub const VARIABLE_INT_MAX_BYTES: usize = 4;

/// MQTT variable byte integer
///
/// Encodes values using 1-4 bytes, seven bits per byte, least significant
/// group first. The top bit of each byte is the continuation flag.
/// - 0-127: 1 byte
/// - 128-16,383: 2 bytes
/// - 16,384-2,097,151: 3 bytes
/// - 2,097,152-268,435,455: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableInt {
    value: u32,
}

impl VariableInt {
    /// Creates a new `VariableInt` from a u32 value
    ///
    /// # Errors
    ///
    /// Returns `MqttError::ProtocolError` if the value exceeds the maximum
    pub fn new(value: u32) -> Result<Self> {
        if value > VARIABLE_INT_MAX {
            return Err(MqttError::ProtocolError(format!(
                "Variable integer value {value} exceeds maximum {VARIABLE_INT_MAX}"
            )));
        }
        Ok(Self { value })
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Returns the number of bytes needed to encode this value
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self.value {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut val = self.value;
        loop {
            #[allow(clippy::cast_possible_truncation)]
            let mut byte = (val % 128) as u8;
            val /= 128;
            if val > 0 {
                byte |= CONTINUATION_BIT;
            }
            buf.put_u8(byte);
            if val == 0 {
                break;
            }
        }
    }

    /// Decodes a variable integer from the buffer
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the buffer runs out before the last byte
    /// or if more than 4 bytes are used
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let mut value = 0u32;
        let mut shift = 0u32;

        for _ in 0..VARIABLE_INT_MAX_BYTES {
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Insufficient bytes for variable integer".to_string(),
                ));
            }
            let byte = buf.get_u8();
            value |= u32::from(byte & VALUE_BITS) << shift;
            if byte & CONTINUATION_BIT == 0 {
                return Ok(Self { value });
            }
            shift += 7;
        }

        Err(MqttError::MalformedPacket(
            "Variable integer exceeds 4 bytes".to_string(),
        ))
    }

    /// Decodes from the front of a byte slice without consuming it
    ///
    /// Returns `Ok(None)` when the slice ends before the encoding does,
    /// otherwise the value and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the first 4 bytes all carry the continuation bit
    pub fn peek(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut value = 0u32;
        for (i, byte) in bytes.iter().take(VARIABLE_INT_MAX_BYTES).enumerate() {
            value |= u32::from(byte & VALUE_BITS) << (7 * i);
            if byte & CONTINUATION_BIT == 0 {
                return Ok(Some((Self { value }, i + 1)));
            }
        }
        if bytes.len() >= VARIABLE_INT_MAX_BYTES {
            return Err(MqttError::MalformedPacket(
                "Variable integer exceeds 4 bytes".to_string(),
            ));
        }
        Ok(None)
    }
}

impl fmt::Display for VariableInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<VariableInt> for u32 {
    fn from(v: VariableInt) -> Self {
        v.value
    }
}

impl TryFrom<u32> for VariableInt {
    type Error = MqttError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VariableInt {
    type Error = MqttError;

    fn try_from(value: usize) -> Result<Self> {
        let value = u32::try_from(value).map_err(|_| {
            MqttError::ProtocolError("Value too large for variable integer".to_string())
        })?;
        Self::new(value)
    }
}

/// Encodes a u32 value as a variable byte integer
///
/// # Errors
///
/// Returns `MqttError::ProtocolError` if the value exceeds the maximum
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    VariableInt::new(value)?.encode(buf);
    Ok(())
}

/// Decodes a variable byte integer from the buffer
///
/// # Errors
///
/// Returns an error if decoding fails
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    Ok(VariableInt::decode(buf)?.value())
}

/// Number of bytes needed to encode `value`, saturating at 4
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    VariableInt {
        value: value.min(VARIABLE_INT_MAX),
    }
    .encoded_size()
}

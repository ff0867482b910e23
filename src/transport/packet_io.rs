//! Framed packet reading and writing over a byte stream

use crate::constants::defaults::READ_BUFFER_SIZE;
use crate::error::{MqttError, Result};
use crate::packet::codec::{decode_packet_limited, encode_packet_into, Decoded};
use crate::packet::Packet;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Reads whole packets from a stream that may deliver them in any chunking
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
    buffer: BytesMut,
    maximum_packet_size: Option<u32>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            maximum_packet_size: None,
        }
    }

    /// Inbound packets above `size` bytes fail with `PacketTooLarge`
    #[must_use]
    pub fn with_maximum_packet_size(mut self, size: Option<u32>) -> Self {
        self.maximum_packet_size = size;
        self
    }

    /// Waits for the next complete packet
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the stream ends, `Io` on read failure, and any
    /// decode error for bytes that do not form a valid packet
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            match decode_packet_limited(&self.buffer, self.maximum_packet_size)? {
                Decoded::Complete { packet, consumed } => {
                    self.buffer.advance(consumed);
                    trace!(packet_type = ?packet.packet_type(), size = consumed, "Read packet");
                    return Ok(packet);
                }
                Decoded::NeedMoreData => {
                    let read = self.inner.read_buf(&mut self.buffer).await?;
                    if read == 0 {
                        return Err(MqttError::ConnectionLost);
                    }
                }
            }
        }
    }
}

/// Encodes and writes packets, one complete packet per write
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// # Errors
    ///
    /// Encoding errors, or `Io` if the stream rejects the write
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.buffer.clear();
        encode_packet_into(packet, &mut self.buffer)?;
        trace!(packet_type = ?packet.packet_type(), size = self.buffer.len(), "Write packet");
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction of the stream
    ///
    /// # Errors
    ///
    /// `Io` if the shutdown fails
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

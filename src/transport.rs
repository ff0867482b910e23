pub mod packet_io;

use tokio::io::{AsyncRead, AsyncWrite};

pub use packet_io::{PacketReader, PacketWriter};

/// A connected, ordered byte stream to the broker
///
/// Anything tokio can read from and write to qualifies: `TcpStream`, a TLS
/// stream, or `tokio::io::DuplexStream` in tests. The session splits it into
/// a read half for the background reader and a write half shared by callers.
/// Dropping or shutting down the write half closes the connection.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

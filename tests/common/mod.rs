//! Scripted broker for driving a session over an in-memory stream

#![allow(dead_code)]

use mqtt5_session::packet::connack::ConnAckPacket;
use mqtt5_session::packet::connect::ConnectPacket;
use mqtt5_session::transport::PacketReader;
use mqtt5_session::{encode_packet, MqttError, Packet, ReasonCode};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Broker side of a duplex pipe; the client gets the other end
pub struct ScriptedBroker {
    reader: PacketReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Creates a connected pair: the client transport and the scripted broker
pub fn pipe() -> (DuplexStream, ScriptedBroker) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(server);
    let broker = ScriptedBroker {
        reader: PacketReader::new(read_half),
        writer: write_half,
    };
    (client, broker)
}

impl ScriptedBroker {
    pub async fn recv(&mut self) -> Packet {
        self.reader
            .read_packet()
            .await
            .expect("broker failed to read a packet")
    }

    /// Reads once, returning the raw outcome so EOF can be asserted
    pub async fn try_recv(&mut self) -> Result<Packet, MqttError> {
        self.reader.read_packet().await
    }

    /// Returns `None` if the client sends nothing within `wait`
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        tokio::time::timeout(wait, self.reader.read_packet())
            .await
            .ok()
            .map(|read| read.expect("broker failed to read a packet"))
    }

    pub async fn send(&mut self, packet: Packet) {
        let bytes = encode_packet(&packet).expect("broker packet must encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer
            .write_all(bytes)
            .await
            .expect("broker failed to write");
        self.writer.flush().await.expect("broker failed to flush");
    }

    pub async fn expect_connect(&mut self) -> ConnectPacket {
        match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    /// Reads CONNECT and answers with a successful CONNACK
    pub async fn accept(&mut self, session_present: bool) -> ConnectPacket {
        self.accept_with(ConnAckPacket::new(session_present, ReasonCode::Success))
            .await
    }

    pub async fn accept_with(&mut self, connack: ConnAckPacket) -> ConnectPacket {
        let connect = self.expect_connect().await;
        self.send(Packet::ConnAck(connack)).await;
        connect
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

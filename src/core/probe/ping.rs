// src/core/probe/ping.rs

//! A handshake-level Minecraft status ping.
//!
//! The probe opens a TCP connection, sends the modern protocol's handshake
//! (next-state = status) followed by a status request, and treats any reply
//! bytes as liveness. Nothing beyond this handshake is implemented.

use crate::core::errors::BlockforgeError;
use bytes::{BufMut, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Protocol version -1: "just tell me your status".
const HANDSHAKE_PROTOCOL: i32 = -1;

fn put_varint(buf: &mut BytesMut, value: i32) {
    let mut remaining = value as u32;
    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            break;
        }
    }
}

fn frame(packet: &[u8]) -> BytesMut {
    let mut framed = BytesMut::with_capacity(packet.len() + 5);
    put_varint(&mut framed, packet.len() as i32);
    framed.extend_from_slice(packet);
    framed
}

/// Builds the handshake packet: id 0x00, protocol version, server address,
/// port, next state 1 (status).
fn handshake_packet(host: &str, port: u16) -> BytesMut {
    let mut packet = BytesMut::new();
    put_varint(&mut packet, 0x00);
    put_varint(&mut packet, HANDSHAKE_PROTOCOL);
    put_varint(&mut packet, host.len() as i32);
    packet.extend_from_slice(host.as_bytes());
    packet.put_u16(port);
    put_varint(&mut packet, 0x01);
    frame(&packet)
}

/// Connects to `host:port`, performs the handshake + status request, and
/// returns the elapsed round-trip on success. The whole exchange is bounded
/// by `timeout`; an unreachable or unresponsive backend yields `Timeout`.
pub async fn status_ping(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Duration, BlockforgeError> {
    let started = Instant::now();
    let exchange = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(&handshake_packet(host, port)).await?;
        // Status request: empty packet with id 0x00.
        stream.write_all(&frame(&[0x00])).await?;

        let mut reply = [0u8; 64];
        let read = stream.read(&mut reply).await?;
        if read == 0 {
            return Err(BlockforgeError::Internal(
                "connection closed before status reply".into(),
            ));
        }
        Ok::<_, BlockforgeError>(())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BlockforgeError::Timeout(format!(
            "status ping to {host}:{port} exceeded {timeout:?}"
        ))),
    }
}

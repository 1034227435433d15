//! Networking primitives.
//!
//! A reliable (TCP) control channel with length-prefixed frames.
//! Reliability semantics for UDP (acking, retry, ordering) live in
//! [`crate::reliable_udp`], which owns the message-plane socket
//! directly.

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::message::Message;

/// TCP control connection with 4-byte big-endian length-prefixed JSON
/// frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &Message) -> anyhow::Result<()> {
        let payload = msg.to_bytes().context("encode message")?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    /// Reads one frame and decodes it. Returns `Ok(None)` for a frame
    /// that fails checksum verification or does not parse as a known
    /// message — the connection itself stays open.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        Ok(Message::from_bytes(&payload))
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// TCP listener producing [`ReliableConn`]s.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_roundtrip_preserves_message() {
        let listener = ReliableListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let sent = Message::auth("alice", "hi");
        let to_send = sent.clone();
        let client = tokio::spawn(async move {
            let mut conn = ReliableConn::connect(addr).await.unwrap();
            conn.send(&to_send).await.unwrap();
        });

        let (mut server_conn, _) = listener.accept().await.unwrap();
        let received = server_conn.recv().await.unwrap().unwrap();
        assert_eq!(received, sent);
        client.await.unwrap();
    }
}

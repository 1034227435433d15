//! Reliable-UDP engine.
//!
//! A thin reliability layer over plain UDP datagrams: a bounded sliding
//! window of unacknowledged sends, fixed-timeout bounded retry, and
//! per-peer in-order delivery with a short out-of-order buffer. Grounded
//! on the original `ReliableUDP` class (`window_size=5, timeout=1.0,
//! max_retries=3`).
//!
//! # Known latent bug (intentionally preserved)
//! The duplicate/stale check on the receive side is `seq <= last_seq`.
//! Sequence numbers are 16-bit and wrap at 65536, so this comparison is
//! not RFC-1982 cyclic-safe: once `seq` wraps past `last_seq`, every
//! subsequent in-order message looks like a duplicate and is silently
//! dropped until `last_seq` itself wraps. This matches the original
//! implementation and is not fixed here.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};

use crate::message::Message;

/// Result handed back to a caller of [`ReliableUdp::send_reliable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Acked,
    RetriesExhausted,
}

struct PendingSend {
    addr: SocketAddr,
    bytes: Bytes,
    sent_at: Instant,
    retries_left: u32,
    done: Option<oneshot::Sender<SendOutcome>>,
}

#[derive(Default)]
struct State {
    next_seq: u16,
    /// Keyed by the sent message's own `id`, not its sequence number:
    /// the ack correlator and the ordering sequence are separate keys.
    in_flight: HashMap<String, PendingSend>,
    recv_last_seq: HashMap<SocketAddr, u16>,
    recv_buffer: HashMap<SocketAddr, BTreeMap<u16, (Message, Instant)>>,
}

/// Shared reliable-UDP engine. One instance is shared (via `Arc`) between
/// the datagram-send path, the UDP reader task, and the periodic
/// timeout/GC loop.
pub struct ReliableUdp {
    socket: Arc<UdpSocket>,
    window: usize,
    timeout: Duration,
    max_retries: u32,
    reorder_ttl: Duration,
    state: Mutex<State>,
}

impl ReliableUdp {
    pub fn new(
        socket: Arc<UdpSocket>,
        window: usize,
        timeout: Duration,
        max_retries: u32,
        reorder_ttl: Duration,
    ) -> Self {
        Self {
            socket,
            window,
            timeout,
            max_retries,
            reorder_ttl,
            state: Mutex::new(State::default()),
        }
    }

    /// Sends `msg` to `addr` with a freshly assigned sequence number and
    /// waits for the matching `ACK`. Blocks until acked or until
    /// `max_retries` resends have all gone unanswered.
    ///
    /// The sliding window bounds concurrent unacked sends: if `window`
    /// sends are already in flight, this call waits for headroom before
    /// assigning a sequence number, rather than unbounded-buffering new
    /// ones.
    pub async fn send_reliable(&self, addr: SocketAddr, msg: Message) -> anyhow::Result<SendOutcome> {
        loop {
            let state = self.state.lock().await;
            let has_headroom = state.in_flight.len() < self.window;
            drop(state);
            if has_headroom {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let msg_id = msg.id().to_string();
        let bytes = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            msg.with_seq(seq).to_bytes()?
        };

        self.socket.send_to(&bytes, addr).await?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.in_flight.insert(
                msg_id,
                PendingSend {
                    addr,
                    bytes,
                    sent_at: Instant::now(),
                    retries_left: self.max_retries,
                    done: Some(tx),
                },
            );
        }

        Ok(rx.await.unwrap_or(SendOutcome::RetriesExhausted))
    }

    /// Sends a datagram directly, bypassing the ack/retry machinery.
    /// Used for fire-and-forget traffic (`PING`/`PONG`) that is not
    /// part of the ordered `CHAT`/`DIRECT` stream.
    pub async fn send_raw(&self, payload: &[u8], addr: SocketAddr) -> anyhow::Result<()> {
        self.socket.send_to(payload, addr).await?;
        Ok(())
    }

    /// Marks the send whose message carried `msg_id` as acknowledged,
    /// waking its waiting `send_reliable` caller.
    pub async fn process_ack(&self, msg_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(mut pending) = state.in_flight.remove(msg_id) {
            if let Some(done) = pending.done.take() {
                let _ = done.send(SendOutcome::Acked);
            }
        }
    }

    /// Processes a received data message from `from` carrying sequence
    /// `seq`. Returns the messages now ready for in-order delivery: the
    /// message just received (if it extends the in-order run) plus any
    /// previously buffered messages that become contiguous as a result.
    /// Duplicates and stale-looking messages (see module docs for the
    /// non-cyclic-safe caveat) are dropped and return an empty vec.
    pub async fn process_received(
        &self,
        from: SocketAddr,
        seq: u16,
        msg: Message,
    ) -> Vec<Message> {
        let mut state = self.state.lock().await;
        let last_seq = state.recv_last_seq.get(&from).copied();

        if let Some(last) = last_seq {
            if seq <= last {
                // Latent bug: not cyclic-safe across the u16 wraparound.
                return Vec::new();
            }
        }

        let expected = last_seq.map(|l| l.wrapping_add(1)).unwrap_or(seq);
        let mut delivered = Vec::new();

        if seq == expected {
            delivered.push(msg);
            let mut next = seq.wrapping_add(1);
            if let Some(buffer) = state.recv_buffer.get_mut(&from) {
                while let Some((buffered_msg, _)) = buffer.remove(&next) {
                    delivered.push(buffered_msg);
                    next = next.wrapping_add(1);
                }
            }
            state.recv_last_seq.insert(from, next.wrapping_sub(1));
        } else {
            state
                .recv_buffer
                .entry(from)
                .or_default()
                .insert(seq, (msg, Instant::now()));
        }

        delivered
    }

    /// One pass of the retry/timeout loop: resends any in-flight send
    /// older than `timeout`, consuming one retry each time, and fails
    /// out sends that have exhausted `max_retries`. Also expires
    /// out-of-order buffer entries older than `reorder_ttl`.
    ///
    /// Callers run this on a fixed interval (the hub and client each
    /// spawn a loop calling it once per tick).
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut to_resend: Vec<(SocketAddr, Bytes)> = Vec::new();
        let mut to_fail: Vec<oneshot::Sender<SendOutcome>> = Vec::new();

        {
            let mut state = self.state.lock().await;
            let expired: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) >= self.timeout)
                .map(|(msg_id, _)| msg_id.clone())
                .collect();

            for msg_id in expired {
                let pending = state.in_flight.get_mut(&msg_id).expect("just matched");
                if pending.retries_left == 0 {
                    if let Some(done) = pending.done.take() {
                        to_fail.push(done);
                    }
                    state.in_flight.remove(&msg_id);
                } else {
                    pending.retries_left -= 1;
                    pending.sent_at = now;
                    to_resend.push((pending.addr, pending.bytes.clone()));
                }
            }

            for buffer in state.recv_buffer.values_mut() {
                buffer.retain(|_, (_, inserted)| now.duration_since(*inserted) < self.reorder_ttl);
            }
        }

        for done in to_fail {
            let _ = done.send(SendOutcome::RetriesExhausted);
        }
        for (addr, bytes) in to_resend {
            let _ = self.socket.send_to(&bytes, addr).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn engine() -> ReliableUdp {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        ReliableUdp::new(
            Arc::new(socket),
            5,
            Duration::from_millis(50),
            3,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn in_order_message_delivers_immediately() {
        let engine = engine().await;
        let delivered = engine
            .process_received(addr(1), 0, Message::chat("alice", "hi", None))
            .await;
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_buffers_then_flushes_contiguous_run() {
        let engine = engine().await;
        assert!(engine
            .process_received(addr(1), 2, Message::chat("alice", "c", None))
            .await
            .is_empty());
        assert!(engine
            .process_received(addr(1), 1, Message::chat("alice", "b", None))
            .await
            .is_empty());
        let delivered = engine
            .process_received(addr(1), 0, Message::chat("alice", "a", None))
            .await;
        assert_eq!(delivered.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_seq_is_dropped() {
        let engine = engine().await;
        engine
            .process_received(addr(1), 0, Message::chat("alice", "a", None))
            .await;
        let delivered = engine
            .process_received(addr(1), 0, Message::chat("alice", "a-again", None))
            .await;
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn ack_wakes_pending_send() {
        let engine = Arc::new(engine().await);
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let e = engine.clone();
        let handle = tokio::spawn(async move { e.send_reliable(server_addr, Message::chat("alice", "hi", None)).await });

        let mut buf = [0u8; 2048];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let received = Message::from_bytes(&buf[..n]).unwrap();
        let msg_id = received.id().to_string();
        engine.process_ack(&msg_id).await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Acked);
    }

    #[tokio::test]
    async fn unacked_send_exhausts_retries() {
        let engine = Arc::new(engine().await);
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let e = engine.clone();
        let handle = tokio::spawn(async move { e.send_reliable(server_addr, Message::chat("alice", "hi", None)).await });

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            engine.tick().await;
        }

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::RetriesExhausted);
    }
}

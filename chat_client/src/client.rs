//! Client engine.
//!
//! Owns the TCP control connection and the UDP message-plane socket,
//! dispatches inbound traffic to a [`CoreEvents`] implementor, and
//! exposes the outbound API (`send_chat`, `send_direct`, `ping_*`,
//! `request_users`, `request_topology`). A background task runs the
//! keepalive ping and the reliable-UDP retry ticker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use chat_shared::config::ChatConfig;
use chat_shared::message::{Message, TopoContent};
use chat_shared::net::ReliableConn;
use chat_shared::reliable_udp::{ReliableUdp, SendOutcome};
use chat_shared::topology::{TopologySnapshot, TopologyTracker};

use crate::callbacks::CoreEvents;

/// Pending request/response correlators for the TCP control channel.
/// `USERS`/`TOPO` carry no request id in the original protocol, so at
/// most one of each can be outstanding at a time.
#[derive(Default)]
struct PendingRequests {
    users: Option<oneshot::Sender<Vec<String>>>,
    topology: Option<oneshot::Sender<TopologySnapshot>>,
}

struct PendingPing {
    target: String,
    sent_at: Instant,
}

/// Connected chat client.
pub struct Client {
    user: String,
    server_udp_addr: SocketAddr,
    tcp_tx: mpsc::UnboundedSender<Message>,
    reliable: Arc<ReliableUdp>,
    topology: Mutex<TopologyTracker>,
    pending: Mutex<PendingRequests>,
    pending_pings: Mutex<HashMap<String, PendingPing>>,
}

impl Client {
    /// Connects to a hub, performs the `AUTH` handshake, and spawns the
    /// background TCP/UDP dispatch tasks and the keepalive timer.
    pub async fn connect(
        cfg: &ChatConfig,
        user: impl Into<String>,
        events: Arc<dyn CoreEvents>,
    ) -> anyhow::Result<Arc<Self>> {
        let user = user.into();
        let tcp_addr: SocketAddr = cfg.tcp_addr.parse().context("parse tcp_addr")?;
        let server_udp_addr: SocketAddr = cfg.udp_addr.parse().context("parse udp_addr")?;

        let mut conn = ReliableConn::connect(tcp_addr).await?;
        conn.send(&Message::auth(&user, "hello")).await?;
        let welcome = conn
            .recv()
            .await?
            .context("connection closed before handshake reply")?;
        match welcome {
            Message::Auth { ref content, .. } if content.starts_with("Hos geldin") => {
                info!(%user, "connected to hub");
            }
            Message::Auth { content, .. } => {
                anyhow::bail!("hub rejected AUTH: {content}");
            }
            other => anyhow::bail!("expected AUTH reply, got {other:?}"),
        }

        let local_udp: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let udp_socket = Arc::new(UdpSocket::bind(local_udp).await.context("bind udp")?);
        let reliable = Arc::new(ReliableUdp::new(
            udp_socket.clone(),
            cfg.window,
            cfg.retry_timeout(),
            cfg.max_retries,
            Duration::from_secs(cfg.reorder_buffer_secs),
        ));

        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            user,
            server_udp_addr,
            tcp_tx,
            reliable,
            topology: Mutex::new(TopologyTracker::new(Duration::from_secs(
                cfg.topology_gc_secs,
            ))),
            pending: Mutex::new(PendingRequests::default()),
            pending_pings: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Self::tcp_loop(client.clone(), conn, tcp_rx, events.clone()));
        tokio::spawn(Self::udp_loop(client.clone(), udp_socket, events.clone()));
        tokio::spawn(Self::tick_loop(client.clone()));
        tokio::spawn(Self::keepalive_loop(client.clone(), Duration::from_secs(cfg.keepalive_secs)));

        // Registers our UDP source address with the hub immediately,
        // rather than waiting for the first keepalive tick, so we can
        // receive broadcast traffic right away.
        client.ping_server().await?;

        Ok(client)
    }

    async fn tcp_loop(
        self: Arc<Self>,
        mut conn: ReliableConn,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        events: Arc<dyn CoreEvents>,
    ) {
        loop {
            tokio::select! {
                incoming = conn.recv() => {
                    match incoming {
                        Ok(Some(msg)) => self.dispatch_tcp(msg, &events).await,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(error = %err, "tcp connection closed");
                            return;
                        }
                    }
                }
                outgoing = outbound.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if let Err(err) = conn.send(&msg).await {
                                warn!(error = %err, "tcp send failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn dispatch_tcp(&self, msg: Message, events: &Arc<dyn CoreEvents>) {
        match msg {
            Message::Join { content: user, .. } => events.on_user_join(&user),
            Message::Leave { content: user, .. } => events.on_user_leave(&user),
            Message::Users { content: users, .. } => {
                events.on_user_list(&users);
                if let Some(tx) = self.pending.lock().await.users.take() {
                    let _ = tx.send(users);
                }
            }
            Message::Topo {
                content: TopoContent::Snapshot(snapshot),
                ..
            } => {
                self.merge_topology(&snapshot).await;
                events.on_topology_data(&snapshot);
                if let Some(tx) = self.pending.lock().await.topology.take() {
                    let _ = tx.send(snapshot);
                }
            }
            Message::Auth { content, .. } => {
                debug!("server notice: {content}");
            }
            other => debug!("ignoring unexpected control message: {:?}", other),
        }
    }

    /// Merges a hub-provided snapshot into the client's local topology
    /// view rather than discarding the client's own measurements,
    /// mirroring the original client's topology-merge behavior.
    async fn merge_topology(&self, snapshot: &TopologySnapshot) {
        let mut topology = self.topology.lock().await;
        for node in &snapshot.nodes {
            topology.upsert_node(&node.user, &node.ip, node.port, node.latency_ms);
        }
        for edge in &snapshot.edges {
            topology.update_link(&edge.from, &edge.to, edge.quality);
        }
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>, events: Arc<dyn CoreEvents>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "udp recv failed");
                    return;
                }
            };
            let Some(msg) = Message::from_bytes(&buf[..n]) else {
                debug!(%from, "dropped malformed udp datagram");
                continue;
            };
            self.dispatch_udp(msg, &events).await;
        }
    }

    async fn dispatch_udp(&self, msg: Message, events: &Arc<dyn CoreEvents>) {
        match msg {
            Message::Chat {
                seq,
                ref user,
                ref content,
                ref time,
                ..
            } => {
                if let Some(seq) = seq {
                    let delivered = self
                        .reliable
                        .process_received(self.server_udp_addr, seq, msg.clone())
                        .await;
                    for delivered_msg in delivered {
                        if let Message::Chat { user, content, time, .. } = delivered_msg {
                            events.on_message(&user, &content, &time);
                        }
                    }
                } else {
                    events.on_message(user, content, time);
                }
            }
            Message::Direct {
                ref user,
                ref content,
                ref time,
                ..
            } => {
                events.on_direct_message(user, content, time, true);
                let ack = Message::ack(&self.user, msg.id().to_string());
                if let Ok(bytes) = ack.to_bytes() {
                    let _ = self.udp_send(&bytes, self.server_udp_addr).await;
                }
            }
            Message::Ack { content: msg_id, .. } => {
                self.reliable.process_ack(&msg_id).await;
            }
            Message::Pong { id, .. } => {
                self.handle_pong(id, events).await;
            }
            Message::Ping { ref user, ref content, .. } => {
                // Another peer's PING reaching us directly (not routed
                // through the hub). Reply in kind so direct peer-to-peer
                // latency probing still works if ever wired up.
                let _ = content;
                debug!(%user, "received direct ping");
            }
            other => debug!("ignoring unexpected udp message: {:?}", other),
        }
    }

    async fn handle_pong(&self, ping_id: String, events: &Arc<dyn CoreEvents>) {
        let pending = {
            let mut pings = self.pending_pings.lock().await;
            pings.remove(&ping_id)
        };
        if let Some(pending) = pending {
            let latency_ms = pending.sent_at.elapsed().as_secs_f64() * 1000.0;
            let quality = TopologyTracker::quality_from_latency(latency_ms);
            let snapshot = {
                let mut topology = self.topology.lock().await;
                topology.upsert_node(&pending.target, "", 0, latency_ms);
                topology.update_link(&self.user, &pending.target, quality);
                topology.snapshot()
            };
            events.on_topology_data(&snapshot);
        }
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            interval.tick().await;
            self.reliable.tick().await;
        }
    }

    async fn keepalive_loop(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(err) = self.ping_server().await {
                warn!(error = %err, "keepalive ping failed");
            }
        }
    }

    /// Sends a reliable `CHAT` broadcast. Resolves `true` once the hub
    /// acks it, `false` once retries are exhausted unanswered.
    pub async fn send_chat(&self, content: impl Into<String>) -> anyhow::Result<bool> {
        let msg = Message::chat(&self.user, content, None);
        let outcome = self.reliable.send_reliable(self.server_udp_addr, msg).await?;
        Ok(outcome == SendOutcome::Acked)
    }

    /// Sends a reliable `DIRECT` message to `recipient`. Resolves `true`
    /// once the hub acks it, `false` once retries are exhausted
    /// unanswered.
    pub async fn send_direct(
        &self,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> anyhow::Result<bool> {
        let msg = Message::direct(&self.user, content, recipient, None);
        let outcome = self.reliable.send_reliable(self.server_udp_addr, msg).await?;
        Ok(outcome == SendOutcome::Acked)
    }

    /// Requests the current user list over the TCP control channel.
    pub async fn request_users(&self) -> anyhow::Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.users = Some(tx);
        self.tcp_tx
            .send(Message::Users {
                id: "req".to_string(),
                time: String::new(),
                user: self.user.clone(),
                content: Vec::new(),
            })
            .ok();
        rx.await.context("hub closed before replying to USERS")
    }

    /// Requests a topology snapshot over the TCP control channel.
    pub async fn request_topology(&self) -> anyhow::Result<TopologySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.topology = Some(tx);
        self.tcp_tx.send(Message::topo_request(&self.user)).ok();
        rx.await.context("hub closed before replying to TOPO")
    }

    pub async fn ping_server(&self) -> anyhow::Result<()> {
        self.send_ping_to_addr("SERVER", None, self.server_udp_addr).await
    }

    pub async fn ping_user(&self, user: impl Into<String>) -> anyhow::Result<()> {
        let user = user.into();
        self.send_ping_to_addr(user.clone(), Some(user), self.server_udp_addr)
            .await
    }

    /// Pings every currently known user, one `PING` per target, all
    /// routed through the hub. Matches the original's `ping_all_users`:
    /// a server-directed ping first, then the user list, then one
    /// recipient-tagged ping per other known username.
    pub async fn ping_all(&self) -> anyhow::Result<()> {
        self.ping_server().await?;
        let users = self.request_users().await?;
        for user in users {
            if user == self.user {
                continue;
            }
            self.ping_user(user).await?;
        }
        Ok(())
    }

    async fn send_ping_to_addr(
        &self,
        target: impl Into<String>,
        recipient: Option<String>,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let target = target.into();
        let ping = Message::ping(&self.user, recipient);
        let ping_id = ping.id().to_string();
        {
            let mut pings = self.pending_pings.lock().await;
            pings.insert(
                ping_id,
                PendingPing {
                    target,
                    sent_at: Instant::now(),
                },
            );
        }
        let payload = ping.to_bytes()?;
        self.udp_send(&payload, addr).await
    }

    async fn udp_send(&self, payload: &[u8], addr: SocketAddr) -> anyhow::Result<()> {
        // The reliable engine owns the bound socket; reach through it
        // for the rare unacked sends (PING) that skip the ack/retry
        // machinery entirely.
        self.reliable.send_raw(payload, addr).await
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

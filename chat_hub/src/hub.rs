//! Hub dispatcher.
//!
//! Accepts TCP control connections (one task per connection) and runs a
//! single UDP reader loop for the message plane. Three pieces of shared
//! state — the session registry, the topology tracker, and the
//! reliable-UDP engine — are each guarded by their own `Mutex`, acquired
//! independently and never nested inside one another. All socket I/O
//! happens outside any lock: fan-out snapshots the target list under the
//! registry lock, then sends after releasing it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tokio::net::UdpSocket;

use chat_shared::config::ChatConfig;
use chat_shared::message::{Message, TopoContent};
use chat_shared::net::{ReliableConn, ReliableListener};
use chat_shared::registry::SessionRegistry;
use chat_shared::reliable_udp::ReliableUdp;
use chat_shared::topology::{TopologyTracker, DEFAULT_EDGE_QUALITY};

/// Name the hub uses when it speaks as itself (handshake replies, etc.)
pub const SERVER_NAME: &str = "SERVER";

/// Shared hub state plus the bound sockets.
pub struct Hub {
    cfg: ChatConfig,
    tcp: ReliableListener,
    udp: Arc<UdpSocket>,
    registry: Mutex<SessionRegistry>,
    topology: Mutex<TopologyTracker>,
    reliable: Arc<ReliableUdp>,
}

impl Hub {
    pub async fn bind(cfg: ChatConfig) -> anyhow::Result<Self> {
        let tcp_addr: SocketAddr = cfg.tcp_addr.parse().context("parse tcp_addr")?;
        let udp_addr: SocketAddr = cfg.udp_addr.parse().context("parse udp_addr")?;

        let tcp = ReliableListener::bind(tcp_addr).await?;
        let udp = Arc::new(UdpSocket::bind(udp_addr).await.context("udp bind")?);

        let reliable = Arc::new(ReliableUdp::new(
            udp.clone(),
            cfg.window,
            cfg.retry_timeout(),
            cfg.max_retries,
            Duration::from_secs(cfg.reorder_buffer_secs),
        ));

        Ok(Self {
            cfg: cfg.clone(),
            tcp,
            udp,
            registry: Mutex::new(SessionRegistry::new()),
            topology: Mutex::new(TopologyTracker::new(Duration::from_secs(
                cfg.topology_gc_secs,
            ))),
            reliable,
        })
    }

    pub fn local_tcp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn local_udp_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    async fn send_udp(&self, msg: &Message, addr: SocketAddr) -> anyhow::Result<()> {
        let payload = msg.to_bytes()?;
        self.udp.send_to(&payload, addr).await?;
        Ok(())
    }

    /// Runs the hub forever: the TCP accept loop, the UDP reader loop,
    /// and the reliable-UDP timeout/GC ticker, concurrently.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let accept_hub = self.clone();
        let udp_hub = self.clone();
        let tick_hub = self.clone();

        let accept_task = tokio::spawn(async move { accept_hub.accept_loop().await });
        let udp_task = tokio::spawn(async move { udp_hub.udp_loop().await });
        let tick_task = tokio::spawn(async move { tick_hub.tick_loop().await });

        tokio::select! {
            res = accept_task => res.context("accept loop panicked")?,
            res = udp_task => res.context("udp loop panicked")?,
            res = tick_task => res.context("tick loop panicked")?,
        }
    }

    async fn tick_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            interval.tick().await;
            self.reliable.tick().await;
        }
    }

    async fn accept_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let (conn, peer_addr) = self.tcp.accept().await?;
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(err) = hub.handle_connection(conn, peer_addr).await {
                    warn!(%peer_addr, error = %err, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut conn: ReliableConn,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let auth = match conn.recv().await? {
            Some(Message::Auth { user, .. }) => user,
            Some(other) => {
                warn!(%peer_addr, "expected AUTH, got {:?}", other);
                return Ok(());
            }
            None => return Ok(()),
        };

        let (tcp_tx, mut tcp_rx) = mpsc::unbounded_channel();
        let registered = {
            let mut registry = self.registry.lock().await;
            registry.register(&auth, tcp_tx)
        };
        if !registered {
            conn.send(&Message::auth(
                SERVER_NAME,
                format!("username '{auth}' already taken"),
            ))
            .await?;
            return Ok(());
        }
        info!(user = %auth, %peer_addr, "user joined");

        conn.send(&Message::auth(
            SERVER_NAME,
            format!("Hos geldin {auth}! UDP port: {}", self.cfg.udp_addr),
        ))
        .await?;

        self.broadcast_tcp(&Message::join(SERVER_NAME, auth.clone()), Some(auth.as_str()))
            .await;

        let outcome = self.connection_loop(&auth, &mut conn, &mut tcp_rx).await;

        let removed = {
            let mut registry = self.registry.lock().await;
            registry.unregister(&auth)
        };
        if removed.is_some() {
            {
                let mut topology = self.topology.lock().await;
                topology.remove_user(&auth);
            }
            info!(user = %auth, "user left");
            self.broadcast_tcp(&Message::leave(SERVER_NAME, auth.clone()), None)
                .await;
        }

        outcome
    }

    async fn connection_loop(
        &self,
        user: &str,
        conn: &mut ReliableConn,
        tcp_rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                incoming = conn.recv() => {
                    match incoming? {
                        None => continue,
                        Some(msg) => {
                            if !self.handle_control_message(user, conn, msg).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                outgoing = tcp_rx.recv() => {
                    match outgoing {
                        Some(msg) => conn.send(&msg).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Handles one control-plane message. Returns `false` when the
    /// connection should close.
    async fn handle_control_message(
        &self,
        user: &str,
        conn: &mut ReliableConn,
        msg: Message,
    ) -> anyhow::Result<bool> {
        {
            let mut registry = self.registry.lock().await;
            registry.touch(user);
        }
        match msg {
            Message::Users { .. } => {
                let users = {
                    let registry = self.registry.lock().await;
                    registry.list_users()
                };
                conn.send(&Message::users(SERVER_NAME, users)).await?;
            }
            Message::Topo {
                content: TopoContent::Request(_),
                ..
            } => {
                let snapshot = {
                    let sessions = {
                        let registry = self.registry.lock().await;
                        registry.all_sessions()
                    };
                    let mut topology = self.topology.lock().await;
                    // Admits every currently-registered user into the
                    // graph before snapshotting, so a TOPO request made
                    // before anyone has PINGed still returns the full
                    // set of known peers, each pair defaulted to
                    // quality 50 unless a real measurement exists.
                    for session in &sessions {
                        if topology.has_node(&session.user) {
                            continue;
                        }
                        let (ip, port) = session
                            .udp_addr
                            .map(|a| (a.ip().to_string(), a.port()))
                            .unwrap_or_default();
                        topology.upsert_node(&session.user, &ip, port, 0.0);
                    }
                    for (i, a) in sessions.iter().enumerate() {
                        for b in &sessions[i + 1..] {
                            if !topology.has_edge(&a.user, &b.user) {
                                topology.update_link(&a.user, &b.user, DEFAULT_EDGE_QUALITY);
                            }
                        }
                    }
                    topology.snapshot()
                };
                conn.send(&Message::topo_reply(SERVER_NAME, snapshot)).await?;
            }
            Message::Leave { .. } => return Ok(false),
            other => {
                debug!(user, "ignoring unexpected control message: {:?}", other);
            }
        }
        Ok(true)
    }

    /// Fans `msg` out to every connected user's TCP control channel,
    /// optionally skipping `exclude`. Collects the send targets under
    /// the registry lock, then sends after releasing it.
    async fn broadcast_tcp(&self, msg: &Message, exclude: Option<&str>) {
        let sessions = {
            let registry = self.registry.lock().await;
            registry.all_sessions()
        };
        for session in sessions {
            if exclude == Some(session.user.as_str()) {
                continue;
            }
            let _ = session.tcp_tx.send(msg.clone());
        }
    }

    async fn udp_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = self.udp.recv_from(&mut buf).await?;
            let Some(msg) = Message::from_bytes(&buf[..n]) else {
                debug!(%from, "dropped udp datagram: bad checksum or parse");
                continue;
            };
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(err) = hub.handle_udp_message(msg, from).await {
                    warn!(%from, error = %err, "udp dispatch failed");
                }
            });
        }
    }

    async fn handle_udp_message(&self, msg: Message, from: SocketAddr) -> anyhow::Result<()> {
        match msg {
            Message::Chat { seq, ref user, .. } => {
                self.bind_udp_source(user, from).await;
                match seq {
                    Some(seq) => {
                        self.send_udp(&Message::ack(SERVER_NAME, msg.id().to_string()), from)
                            .await?;
                        // Only messages process_received judges newly
                        // in-order are fanned out: a lost-ACK retransmit
                        // of an already-delivered seq must not reach
                        // other users twice.
                        let delivered = self.reliable.process_received(from, seq, msg.clone()).await;
                        for delivered_msg in delivered {
                            let sender = delivered_msg.user().to_string();
                            self.broadcast_udp(&delivered_msg, Some(sender.as_str())).await;
                        }
                    }
                    None => self.broadcast_udp(&msg, Some(user.as_str())).await,
                }
            }
            Message::Direct { seq, ref user, .. } => {
                self.bind_udp_source(user, from).await;
                let to_forward = match seq {
                    Some(seq) => {
                        self.send_udp(&Message::ack(SERVER_NAME, msg.id().to_string()), from)
                            .await?;
                        self.reliable.process_received(from, seq, msg.clone()).await
                    }
                    None => vec![msg],
                };
                for delivered_msg in to_forward {
                    let Message::Direct { ref recipient, .. } = delivered_msg else {
                        continue;
                    };
                    let target = {
                        let registry = self.registry.lock().await;
                        registry.lookup(recipient)
                    };
                    if let Some(session) = target {
                        if let Some(addr) = session.udp_addr {
                            self.send_udp(&delivered_msg, addr).await?;
                        }
                    }
                    // No registered UDP address for the recipient: silently
                    // dropped, matching the original hub.
                }
            }
            Message::Ack { content: msg_id, .. } => {
                self.reliable.process_ack(&msg_id).await;
            }
            Message::Ping { ref user, .. } => {
                self.bind_udp_source(user, from).await;
                {
                    let mut topology = self.topology.lock().await;
                    topology.upsert_node(user, &from.ip().to_string(), from.port(), 0.0);
                    let peers: Vec<String> = {
                        let registry = self.registry.lock().await;
                        registry
                            .list_users()
                            .into_iter()
                            .filter(|u| u != user)
                            .collect()
                    };
                    for peer in peers {
                        topology.update_link(user, &peer, DEFAULT_EDGE_QUALITY);
                    }
                }
                self.send_udp(&Message::pong(SERVER_NAME, msg.id().to_string()), from)
                    .await?;
            }
            Message::Pong { .. } => {
                // The hub never originates PING itself; a PONG arriving
                // here has no waiting party and is ignored.
            }
            other => {
                debug!(%from, "ignoring unexpected udp message: {:?}", other);
            }
        }
        Ok(())
    }

    async fn bind_udp_source(&self, user: &str, addr: SocketAddr) {
        let mut registry = self.registry.lock().await;
        registry.bind_udp(user, addr);
    }

    /// Fans `msg` out over UDP to every session with a known UDP
    /// address, optionally skipping `exclude`.
    async fn broadcast_udp(&self, msg: &Message, exclude: Option<&str>) {
        let sessions = {
            let registry = self.registry.lock().await;
            registry.all_sessions()
        };
        for session in sessions {
            if exclude == Some(session.user.as_str()) {
                continue;
            }
            if let Some(addr) = session.udp_addr {
                let _ = self.send_udp(msg, addr).await;
            }
        }
    }
}

//! Session registry.
//!
//! Tracks each connected user's TCP handle, optional UDP address, and
//! last-activity time. Registration is first-wins: a second `AUTH` for a
//! username already present is rejected rather than overwriting the
//! existing session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::message::Message;

/// Outbound channel to one connected TCP client.
pub type TcpSender = mpsc::UnboundedSender<Message>;

/// One registered user.
#[derive(Clone)]
pub struct Session {
    pub user: String,
    pub tcp_tx: TcpSender,
    pub udp_addr: Option<SocketAddr>,
    pub last_seen: Instant,
}

/// Username-keyed registry of active sessions. Not internally locked —
/// the hub guards one instance behind a single `Mutex`, acquired
/// independently of (never nested with) the topology or reliable-UDP
/// locks.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `user` if not already present. Returns `false` (and
    /// leaves the existing session untouched) if the name is taken.
    pub fn register(&mut self, user: &str, tcp_tx: TcpSender) -> bool {
        if self.sessions.contains_key(user) {
            return false;
        }
        self.sessions.insert(
            user.to_string(),
            Session {
                user: user.to_string(),
                tcp_tx,
                udp_addr: None,
                last_seen: Instant::now(),
            },
        );
        true
    }

    /// Records the UDP source address a user's traffic is arriving
    /// from. Called on first `PING`/`CHAT`/`DIRECT` the hub sees from
    /// that address.
    pub fn bind_udp(&mut self, user: &str, addr: SocketAddr) {
        if let Some(session) = self.sessions.get_mut(user) {
            session.udp_addr = Some(addr);
            session.last_seen = Instant::now();
        }
    }

    pub fn touch(&mut self, user: &str) {
        if let Some(session) = self.sessions.get_mut(user) {
            session.last_seen = Instant::now();
        }
    }

    /// Removes and returns the session, if present, so the caller can
    /// perform any outside-the-lock cleanup (broadcasting `LEAVE`,
    /// dropping topology entries) with the removed data in hand.
    pub fn unregister(&mut self, user: &str) -> Option<Session> {
        self.sessions.remove(user)
    }

    pub fn lookup(&self, user: &str) -> Option<Session> {
        self.sessions.get(user).cloned()
    }

    pub fn list_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.sessions.keys().cloned().collect();
        users.sort();
        users
    }

    /// Snapshot of every session, for fan-out. Cloning the handles (not
    /// holding the lock) lets the caller send outside of it.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> TcpSender {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn first_registration_wins() {
        let mut reg = SessionRegistry::new();
        assert!(reg.register("alice", sender()));
        assert!(!reg.register("alice", sender()));
        assert_eq!(reg.list_users().len(), 1);
    }

    #[test]
    fn unregister_returns_removed_session() {
        let mut reg = SessionRegistry::new();
        reg.register("alice", sender());
        let removed = reg.unregister("alice").unwrap();
        assert_eq!(removed.user, "alice");
        assert!(reg.unregister("alice").is_none());
    }

    #[test]
    fn list_users_is_sorted() {
        let mut reg = SessionRegistry::new();
        reg.register("bob", sender());
        reg.register("alice", sender());
        assert_eq!(reg.list_users(), vec!["alice".to_string(), "bob".to_string()]);
    }
}

//! `chat_hub`
//!
//! Hub-side dispatcher:
//! - TCP: session control plane (AUTH, USERS, JOIN, LEAVE, TOPO)
//! - UDP: message plane (CHAT, ACK, DIRECT, PING, PONG)

pub mod hub;

pub use hub::Hub;

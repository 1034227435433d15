//! `chat_client`
//!
//! Client-side engine:
//! - TCP: session control plane (AUTH, USERS, JOIN, LEAVE, TOPO)
//! - UDP: message plane (CHAT, ACK, DIRECT, PING, PONG)
//!
//! Front ends (CLI, GUI) drive the engine through [`Client`] and receive
//! events through a [`CoreEvents`] implementation they own, rather than
//! the engine holding a reference back to the front end.

pub mod callbacks;
pub mod client;

pub use callbacks::{CoreEvents, NullEvents};
pub use client::Client;

//! `chat_shared`
//!
//! Shared library used by both the hub and the client: the wire codec,
//! the reliable-UDP engine, topology tracking, the session registry, and
//! the TCP/UDP transport primitives built on top of them.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (message, reliable_udp, topology,
//!   registry, net, config).
//! - No `unsafe`.

pub mod config;
pub mod message;
pub mod net;
pub mod registry;
pub mod reliable_udp;
pub mod topology;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::message::*;
    pub use crate::net::*;
    pub use crate::registry::*;
    pub use crate::reliable_udp::*;
    pub use crate::topology::*;
}

//! Event callback surface.
//!
//! GUI and CLI front ends implement [`CoreEvents`] and hand it to
//! [`crate::client::Client`] as a `Box<dyn CoreEvents>` rather than the
//! engine holding a reference back to the front end — this is what
//! keeps a GUI and the engine from retaining each other.

use chat_shared::topology::TopologySnapshot;

/// Callbacks the client engine invokes as protocol events arrive. Every
/// method has a no-op default so implementors only override what they
/// care about.
pub trait CoreEvents: Send + Sync {
    /// A broadcast chat message from `user`, sent at `time`.
    fn on_message(&self, _user: &str, _content: &str, _time: &str) {}

    /// A message addressed to the local user, sent at `time`. `is_direct`
    /// is always `true` for the current transport (every `on_direct_message`
    /// call originates from a `DIRECT` datagram) but is part of the
    /// callback surface so a future peer-to-peer path can reuse it.
    fn on_direct_message(&self, _user: &str, _content: &str, _time: &str, _is_direct: bool) {}

    fn on_user_join(&self, _user: &str) {}

    fn on_user_leave(&self, _user: &str) {}

    fn on_user_list(&self, _users: &[String]) {}

    fn on_topology_data(&self, _snapshot: &TopologySnapshot) {}
}

/// A [`CoreEvents`] implementation that does nothing, useful for
/// headless tests and as the engine's default.
pub struct NullEvents;

impl CoreEvents for NullEvents {}

//! Wire codec.
//!
//! # Reference
//! This protocol is distilled from a Python hybrid TCP/UDP chat program
//! (`hybrid_protocol.py`'s `ChatProtocol`). The wire format is a flat JSON
//! object per message: `type`, `id`, `time`, `user`, `content`, optional
//! `seq`, optional `recipient`, and a `checksum` covering every other
//! field.
//!
//! # Typed API, flat wire
//! Rather than dispatch on the `type` string at every call site, the
//! in-process API is the [`Message`] enum: an internally-tagged variant
//! per message kind, each carrying only the fields that kind uses. The
//! flat, string-tagged wire shape is preserved by transcoding through a
//! [`serde_json::Value`] at the codec boundary — the typed enum itself
//! never stores a checksum field.

use anyhow::Context;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::topology::TopologySnapshot;

/// Length, in characters, of the truncated base64 checksum.
pub const CHECKSUM_LEN: usize = 12;

/// A fully typed protocol message. See module docs for the wire mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "AUTH")]
    Auth {
        id: String,
        time: String,
        user: String,
        content: String,
    },
    #[serde(rename = "CHAT")]
    Chat {
        id: String,
        time: String,
        user: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u16>,
    },
    #[serde(rename = "ACK")]
    Ack {
        id: String,
        time: String,
        user: String,
        /// The `id` of the `CHAT`/`DIRECT` message being acknowledged.
        content: String,
    },
    #[serde(rename = "USERS")]
    Users {
        id: String,
        time: String,
        user: String,
        content: Vec<String>,
    },
    #[serde(rename = "JOIN")]
    Join {
        id: String,
        time: String,
        user: String,
        content: String,
    },
    #[serde(rename = "LEAVE")]
    Leave {
        id: String,
        time: String,
        user: String,
        content: String,
    },
    #[serde(rename = "DIRECT")]
    Direct {
        id: String,
        time: String,
        user: String,
        content: String,
        recipient: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u16>,
    },
    #[serde(rename = "PING")]
    Ping {
        id: String,
        time: String,
        user: String,
        /// Stringified origin timestamp (seconds, fractional), echoed back
        /// verbatim in the matching `PONG`'s `id`.
        content: String,
        /// Present when a client targets a specific peer (direct ping).
        /// The hub accepts and ignores this field — it always answers the
        /// immediate sender, mirroring the original Python hub.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
    },
    #[serde(rename = "PONG")]
    Pong {
        /// Echoes the originating `PING`'s `id`.
        id: String,
        time: String,
        user: String,
        content: String,
    },
    #[serde(rename = "TOPO")]
    Topo {
        id: String,
        time: String,
        user: String,
        content: TopoContent,
    },
}

/// `TOPO` content varies by direction: a client request carries the
/// literal string `"GET"`, a hub reply carries a full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopoContent {
    Request(String),
    Snapshot(TopologySnapshot),
}

fn now_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    ms.to_string()
}

fn now_time() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Message {
    pub fn auth(user: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Auth {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: content.into(),
        }
    }

    pub fn chat(user: impl Into<String>, content: impl Into<String>, id: Option<String>) -> Self {
        Message::Chat {
            id: id.unwrap_or_else(now_id),
            time: now_time(),
            user: user.into(),
            content: content.into(),
            seq: None,
        }
    }

    /// Builds an `ACK` for the given message id.
    pub fn ack(user: impl Into<String>, acked_id: impl Into<String>) -> Self {
        Message::Ack {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: acked_id.into(),
        }
    }

    pub fn users(user: impl Into<String>, usernames: Vec<String>) -> Self {
        Message::Users {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: usernames,
        }
    }

    pub fn join(user: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Join {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: content.into(),
        }
    }

    pub fn leave(user: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Leave {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: content.into(),
        }
    }

    pub fn direct(
        user: impl Into<String>,
        content: impl Into<String>,
        recipient: impl Into<String>,
        id: Option<String>,
    ) -> Self {
        Message::Direct {
            id: id.unwrap_or_else(now_id),
            time: now_time(),
            user: user.into(),
            content: content.into(),
            recipient: recipient.into(),
            seq: None,
        }
    }

    pub fn ping(user: impl Into<String>, recipient: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Message::Ping {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: timestamp.to_string(),
            recipient,
        }
    }

    pub fn pong(user: impl Into<String>, echoed_id: impl Into<String>) -> Self {
        Message::Pong {
            id: echoed_id.into(),
            time: now_time(),
            user: user.into(),
            content: String::new(),
        }
    }

    pub fn topo_request(user: impl Into<String>) -> Self {
        Message::Topo {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: TopoContent::Request("GET".to_string()),
        }
    }

    pub fn topo_reply(user: impl Into<String>, snapshot: TopologySnapshot) -> Self {
        Message::Topo {
            id: now_id(),
            time: now_time(),
            user: user.into(),
            content: TopoContent::Snapshot(snapshot),
        }
    }

    /// The message-id field, present on every variant.
    pub fn id(&self) -> &str {
        match self {
            Message::Auth { id, .. }
            | Message::Chat { id, .. }
            | Message::Ack { id, .. }
            | Message::Users { id, .. }
            | Message::Join { id, .. }
            | Message::Leave { id, .. }
            | Message::Direct { id, .. }
            | Message::Ping { id, .. }
            | Message::Pong { id, .. }
            | Message::Topo { id, .. } => id,
        }
    }

    /// The sender-username field, present on every variant.
    pub fn user(&self) -> &str {
        match self {
            Message::Auth { user, .. }
            | Message::Chat { user, .. }
            | Message::Ack { user, .. }
            | Message::Users { user, .. }
            | Message::Join { user, .. }
            | Message::Leave { user, .. }
            | Message::Direct { user, .. }
            | Message::Ping { user, .. }
            | Message::Pong { user, .. }
            | Message::Topo { user, .. } => user,
        }
    }

    /// Sets or rewrites the `seq` field on `Chat`/`Direct` variants. A
    /// no-op on variants that have no sequence field, matching the
    /// reliable-UDP engine's "rewrite the payload's seq field if it is
    /// JSON; otherwise passes through" contract (spec.md 4.2.1).
    pub fn with_seq(mut self, seq: u16) -> Self {
        match &mut self {
            Message::Chat { seq: s, .. } | Message::Direct { seq: s, .. } => *s = Some(seq),
            _ => {}
        }
        self
    }

    pub fn seq(&self) -> Option<u16> {
        match self {
            Message::Chat { seq, .. } | Message::Direct { seq, .. } => *seq,
            _ => None,
        }
    }

    /// Serializes with a freshly computed checksum appended.
    pub fn to_bytes(&self) -> anyhow::Result<bytes::Bytes> {
        let mut value = serde_json::to_value(self).context("serialize message")?;
        let checksum = checksum_of(&value)?;
        value
            .as_object_mut()
            .context("message did not serialize to an object")?
            .insert("checksum".to_string(), Value::String(checksum));
        Ok(bytes::Bytes::from(serde_json::to_vec(&value)?))
    }

    /// Parses and verifies a wire frame. Returns `None` on any parse
    /// failure or checksum mismatch — per spec.md 4.1/7, framing errors
    /// never surface as an `Err` to callers.
    pub fn from_bytes(data: &[u8]) -> Option<Message> {
        let mut value: Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(error = %err, "dropped frame: not valid json");
                return None;
            }
        };
        let Some(obj) = value.as_object_mut() else {
            tracing::debug!("dropped frame: not a json object");
            return None;
        };
        let claimed = match obj.remove("checksum") {
            Some(Value::String(s)) => s,
            _ => {
                tracing::debug!("dropped frame: missing checksum field");
                return None;
            }
        };
        let computed = match checksum_of(&value) {
            Ok(c) => c,
            Err(err) => {
                tracing::debug!(error = %err, "dropped frame: failed to compute checksum");
                return None;
            }
        };
        if claimed != computed {
            tracing::debug!("dropped frame: checksum mismatch");
            return None;
        }
        match serde_json::from_value(value) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::debug!(error = %err, "dropped frame: unrecognized message shape");
                None
            }
        }
    }
}

/// Computes the 12-character base64-prefix-of-SHA-256 checksum over the
/// canonical (sorted-key) serialization of `value`, which must not
/// contain a `checksum` key.
fn checksum_of(value: &Value) -> anyhow::Result<String> {
    let canonical = serde_json::to_vec(value).context("canonicalize message")?;
    let digest = Sha256::digest(&canonical);
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    Ok(encoded.chars().take(CHECKSUM_LEN).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_roundtrips_through_bytes() {
        let msg = Message::chat("alice", "hi", None);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn auth_reply_roundtrips() {
        let msg = Message::auth("SERVER", "Hos geldin alice! UDP port: 12346");
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn users_list_roundtrips() {
        let msg = Message::users("SERVER", vec!["alice".into(), "bob".into()]);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn direct_roundtrips_with_recipient_and_seq() {
        let msg = Message::direct("alice", "psst", "bob", None).with_seq(42);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.seq(), Some(42));
    }

    #[test]
    fn topo_request_and_reply_roundtrip() {
        let req = Message::topo_request("alice");
        let bytes = req.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), req);

        let snap = TopologySnapshot::default();
        let reply = Message::topo_reply("SERVER", snap);
        let bytes = reply.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), reply);
    }

    #[test]
    fn tampered_field_fails_checksum() {
        let msg = Message::chat("alice", "hi", None);
        let bytes = msg.to_bytes().unwrap();
        let mut tampered: Value = serde_json::from_slice(&bytes).unwrap();
        tampered["content"] = Value::String("hacked".to_string());
        let tampered_bytes = serde_json::to_vec(&tampered).unwrap();
        assert!(Message::from_bytes(&tampered_bytes).is_none());
    }

    #[test]
    fn missing_checksum_is_rejected() {
        let mut value = serde_json::to_value(Message::chat("alice", "hi", None)).unwrap();
        value.as_object_mut().unwrap().remove("checksum");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Message::from_bytes(&bytes).is_none());
    }

    #[test]
    fn garbage_bytes_never_panic() {
        assert!(Message::from_bytes(b"not json at all").is_none());
        assert!(Message::from_bytes(b"{\"type\":\"CHAT\"}").is_none());
        assert!(Message::from_bytes(b"").is_none());
    }

    #[test]
    fn pong_echoes_ping_id() {
        let ping = Message::ping("alice", None);
        let pong = Message::pong("bob", ping.id().to_string());
        assert_eq!(pong.id(), ping.id());
    }
}

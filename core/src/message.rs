//! Control-protocol messages exchanged with the master
//!
//! Every message is a `{type, data, node_id, version}` record whose `data`
//! payload is a JSON-like tree of primitives, lists, and maps. The wire
//! codec lives here too: a message serializes to a single JSON document,
//! which the transport wraps in a length-prefixed frame. The rest of the
//! runtime only ever sees [`Message`] values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Fixed protocol version carried by every message
pub const PROTOCOL_VERSION: i64 = 1;

/// Inbound: master asks the worker to reconcile to a new user population
pub const SPAWN: &str = "spawn";
/// Inbound: master asks the worker to tear down all users
pub const STOP: &str = "stop";
/// Inbound: master asks the worker to shut down
pub const QUIT: &str = "quit";
/// Inbound: master asks the worker to re-register
pub const RECONNECT: &str = "reconnect";
/// Inbound: master acknowledges a `client_ready` handshake
pub const ACK: &str = "ack";
/// Exchanged both ways: liveness signal
pub const HEARTBEAT: &str = "heartbeat";
/// Outbound: worker announces itself to the master
pub const CLIENT_READY: &str = "client_ready";
/// Outbound: worker confirms all users are gone
pub const CLIENT_STOPPED: &str = "client_stopped";
/// Outbound: worker reached its spawn target
pub const SPAWNING_COMPLETE: &str = "spawning_complete";
/// Outbound: periodic stats snapshot
pub const STATS: &str = "stats";
/// Outbound: unhandled user-code error relayed to the master
pub const EXCEPTION: &str = "exception";

/// One control-protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, dispatched on by the runner
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    /// Sender identity, `<hostname>_<32-hex>` for workers
    pub node_id: String,

    /// Protocol version
    pub version: i64,
}

impl Message {
    /// Create a message with an explicit payload
    pub fn new(kind: impl Into<String>, data: Map<String, Value>, node_id: &str) -> Self {
        Self {
            kind: kind.into(),
            data,
            node_id: node_id.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Create a message with an empty payload
    pub fn empty(kind: impl Into<String>, node_id: &str) -> Self {
        Self::new(kind, Map::new(), node_id)
    }

    /// Worker registration handshake
    pub fn client_ready(node_id: &str) -> Self {
        let mut data = Map::new();
        data.insert("version".into(), PROTOCOL_VERSION.into());
        Self::new(CLIENT_READY, data, node_id)
    }

    /// All users torn down
    pub fn client_stopped(node_id: &str) -> Self {
        Self::empty(CLIENT_STOPPED, node_id)
    }

    /// Spawn reconcile finished at `user_count` users
    pub fn spawning_complete(node_id: &str, user_count: u64) -> Self {
        let mut data = Map::new();
        data.insert("user_count".into(), user_count.into());
        Self::new(SPAWNING_COMPLETE, data, node_id)
    }

    /// Periodic liveness signal with the runner state and CPU load
    pub fn heartbeat(node_id: &str, state: &str, current_cpu_usage: f64, count: u64) -> Self {
        let mut data = Map::new();
        data.insert("state".into(), state.into());
        data.insert("current_cpu_usage".into(), current_cpu_usage.into());
        data.insert("count".into(), count.into());
        Self::new(HEARTBEAT, data, node_id)
    }

    /// Stats snapshot, with the live user count piggybacked
    pub fn stats(node_id: &str, mut report: Map<String, Value>, user_count: u64) -> Self {
        report.insert("user_count".into(), user_count.into());
        Self::new(STATS, report, node_id)
    }

    /// Unhandled user-code error
    pub fn exception(node_id: &str, msg: &str, traceback: &str) -> Self {
        let mut data = Map::new();
        data.insert("msg".into(), msg.into());
        data.insert("traceback".into(), traceback.into());
        Self::new(EXCEPTION, data, node_id)
    }

    /// Encode to the wire representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("encode failed: {e}")))
    }

    /// Decode from the wire representation
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("decode failed: {e}")))
    }

    /// Target population of an inbound `spawn`, `(user_count, spawn_rate)`
    ///
    /// Per-user-class counts are summed into the total when the flat
    /// `user_count` field is absent.
    pub fn spawn_target(&self) -> Option<(u64, f64)> {
        let rate = self
            .data
            .get("spawn_rate")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if let Some(count) = self.data.get("user_count").and_then(Value::as_u64) {
            return Some((count, rate));
        }
        let classes = self.data.get("user_classes_count")?.as_object()?;
        let count = classes.values().filter_map(Value::as_u64).sum();
        Some((count, rate))
    }
}

/// Node identity for this worker process: `<hostname>_<32-hex>`
///
/// The hex token is process-random, so several workers on one host stay
/// distinguishable to the master.
pub fn node_id() -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!("{hostname}_{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_round_trip_all_outbound_types() {
        let mut report = Map::new();
        report.insert("stats".into(), Value::Array(vec![]));

        round_trip(Message::client_ready("node_1"));
        round_trip(Message::client_stopped("node_1"));
        round_trip(Message::spawning_complete("node_1", 25));
        round_trip(Message::heartbeat("node_1", "running", 12.5, 25));
        round_trip(Message::stats("node_1", report, 25));
        round_trip(Message::exception("node_1", "boom", "task panicked"));
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let message = Message::empty(STOP, "master");
        let bytes = message.encode().unwrap();
        // empty payloads are omitted from the wire form entirely
        assert!(!String::from_utf8(bytes.clone()).unwrap().contains("data"));
        assert_eq!(Message::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json at all"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_spawn_target_flat_count() {
        let mut data = Map::new();
        data.insert("user_count".into(), 10.into());
        data.insert("spawn_rate".into(), 2.5.into());
        let message = Message::new(SPAWN, data, "master");

        assert_eq!(message.spawn_target(), Some((10, 2.5)));
    }

    #[test]
    fn test_spawn_target_per_class_counts() {
        let mut classes = Map::new();
        classes.insert("Browsing".into(), 6.into());
        classes.insert("Checkout".into(), 4.into());
        let mut data = Map::new();
        data.insert("user_classes_count".into(), Value::Object(classes));
        let message = Message::new(SPAWN, data, "master");

        assert_eq!(message.spawn_target(), Some((10, 1.0)));
    }

    #[test]
    fn test_spawn_target_missing() {
        let message = Message::empty(SPAWN, "master");
        assert_eq!(message.spawn_target(), None);
    }

    #[test]
    fn test_node_id_shape() {
        let id = node_id();
        let (_, hex) = id.rsplit_once('_').unwrap();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(node_id(), id);
    }
}

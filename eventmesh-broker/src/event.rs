use chrono::Utc;
use eventmesh_core::models::{generate_id, ServerId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of synthetic heartbeat pings
pub const EVENT_TYPE_PING: &str = "ping";

/// Event type written by transports when a stream is opened
pub const EVENT_TYPE_CONNECTED: &str = "connected";

/// A single event pushed to client streams.
///
/// Immutable once published. `origin_server_id` is stamped by the event bus
/// at publish time so receiving instances can discard echoes of events they
/// themselves put on the session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload; the broker never inspects its semantics
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    pub origin_server_id: ServerId,
}

impl Event {
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: generate_id(),
            event_type: event_type.into(),
            data,
            retry: None,
            origin_server_id: ServerId::from_string(String::new()),
        }
    }

    /// Set the client reconnection-delay hint
    #[must_use]
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Synthetic heartbeat event carrying a Unix timestamp payload
    #[must_use]
    pub fn ping() -> Self {
        Self::new(EVENT_TYPE_PING, Value::from(Utc::now().timestamp()))
    }

    /// Initial event a transport writes when the stream is established
    #[must_use]
    pub fn connection_established() -> Self {
        Self::new(EVENT_TYPE_CONNECTED, Value::from("ok"))
    }

    #[must_use]
    pub fn is_ping(&self) -> bool {
        self.event_type == EVENT_TYPE_PING
    }
}

/// Membership change broadcast on a session's membership-update channel
/// when an instance gains or loses clients for that session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub session_id: SessionId,
    pub server_id: ServerId,
    pub action: MembershipAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Joined,
    Left,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_round_trip() {
        let event = Event {
            id: "ev1".to_string(),
            event_type: "token".to_string(),
            data: json!({"text": "hello"}),
            retry: Some(3000),
            origin_server_id: ServerId::from_string("srv-a".to_string()),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"token\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_retry_omitted_when_unset() {
        let event = Event::new("progress", json!(42));
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("retry"));
    }

    #[test]
    fn test_ping_carries_unix_timestamp() {
        let ping = Event::ping();
        assert!(ping.is_ping());
        let ts = ping.data.as_i64().unwrap();
        assert!(ts > 0);
    }

    #[test]
    fn test_membership_update_round_trip() {
        let update = MembershipUpdate {
            session_id: SessionId::from_string("s1".to_string()),
            server_id: ServerId::from_string("srv-b".to_string()),
            action: MembershipAction::Joined,
        };

        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"joined\""));

        let back: MembershipUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}

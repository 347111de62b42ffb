use eventmesh_core::models::{ClientId, ServerId, SessionId};

/// Default prefix for all keys and channels
pub const DEFAULT_KEY_PREFIX: &str = "eventmesh:";

/// Builder for the distributed-store key namespace.
///
/// Key layout:
/// - `conn:<clientID>` — serialized connection record
/// - `session-conns:<sessionID>` — set of client IDs in a session
/// - `server-conns:<serverID>` — set of client IDs owned by an instance
/// - `chan:client:<clientID>` — pub/sub channel for single-client events
/// - `chan:session:<sessionID>` — pub/sub channel for session-wide events
/// - `chan:session-members:<sessionID>` — membership add/remove notifications
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn conn(&self, id: &ClientId) -> String {
        format!("{}conn:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn session_conns(&self, id: &SessionId) -> String {
        format!("{}session-conns:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn session_clients(&self, id: &SessionId) -> String {
        format!("{}session-clients:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn server_conns(&self, id: &ServerId) -> String {
        format!("{}server-conns:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn client_channel(&self, id: &ClientId) -> String {
        format!("{}chan:client:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn session_channel(&self, id: &SessionId) -> String {
        format!("{}chan:session:{}", self.prefix, id.as_str())
    }

    #[must_use]
    pub fn membership_channel(&self, id: &SessionId) -> String {
        format!("{}chan:session-members:{}", self.prefix, id.as_str())
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

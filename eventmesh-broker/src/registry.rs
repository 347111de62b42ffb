use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use eventmesh_core::models::{ClientId, ServerId, SessionId};
use eventmesh_core::{Error, Result};

use crate::keys::Keys;

/// Default TTL on connection records and their index sets
pub const DEFAULT_CONNECTION_TTL_SECS: u64 = 300;

/// Connection liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Registry record for one live client connection.
///
/// `server_id` always names the instance that performed the write; at most
/// one record exists per client ID.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClientConnection {
    pub id: ClientId,
    pub session_id: SessionId,
    pub server_id: ServerId,
    pub state: ConnectionState,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ClientConnection {
    #[must_use]
    pub fn new(id: ClientId, session_id: SessionId, server_id: ServerId) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            server_id,
            state: ConnectionState::Connected,
            last_seen: now,
            created_at: now,
        }
    }
}

/// Authoritative, TTL-bounded record of connection ownership, shared across
/// all server instances.
///
/// All operations surface the underlying store's errors unchanged; retry
/// policy belongs to the caller. Absent records are `NotFound`, never an
/// empty success, so callers can tell "never existed" from "empty session".
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Write the record and add the client to the session and server index
    /// sets in one atomic batch, all with the registry TTL
    async fn register(&self, conn: &ClientConnection) -> Result<()>;

    /// Remove the record and both index memberships. `NotFound` when the
    /// record already expired; callers treat that as a benign no-op.
    async fn unregister(&self, client_id: &ClientId) -> Result<()>;

    /// Rewrite the record with a new state, refreshing `last_seen` and TTL
    async fn update_state(&self, client_id: &ClientId, state: ConnectionState) -> Result<()>;

    /// Refresh `last_seen` and the TTL. Used by the heartbeat path.
    async fn touch(&self, client_id: &ClientId) -> Result<()>;

    async fn get(&self, client_id: &ClientId) -> Result<ClientConnection>;

    async fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<ClientConnection>>;

    async fn list_by_server(&self, server_id: &ServerId) -> Result<Vec<ClientConnection>>;

    /// Unregister every connection owned by `server_id` whose `last_seen`
    /// is older than `timeout`. Returns the reclaimed records. This is the
    /// sole mechanism that recovers state after ungraceful termination.
    async fn sweep_expired(
        &self,
        server_id: &ServerId,
        timeout: Duration,
    ) -> Result<Vec<ClientConnection>>;
}

/// Redis-backed registry for multi-instance deployments
pub struct RedisConnectionRegistry {
    redis: redis::aio::ConnectionManager,
    keys: Keys,
    ttl_secs: u64,
}

impl RedisConnectionRegistry {
    #[must_use]
    pub fn new(redis: redis::aio::ConnectionManager, keys: Keys, ttl_secs: u64) -> Self {
        Self {
            redis,
            keys,
            ttl_secs,
        }
    }

    async fn write_record(&self, record: &ClientConnection) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(self.keys.conn(&record.id), payload, self.ttl_secs)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionRegistry for RedisConnectionRegistry {
    async fn register(&self, conn: &ClientConnection) -> Result<()> {
        let payload = serde_json::to_string(conn)?;
        let session_key = self.keys.session_conns(&conn.session_id);
        let server_key = self.keys.server_conns(&conn.server_id);
        let mut redis = self.redis.clone();

        // Single atomic batch: a crash mid-write cannot leave the record
        // present without its indices (or vice versa) beyond TTL staleness
        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.keys.conn(&conn.id), payload, self.ttl_secs)
            .ignore()
            .sadd(&session_key, conn.id.as_str())
            .ignore()
            .expire(&session_key, self.ttl_secs as i64)
            .ignore()
            .sadd(&server_key, conn.id.as_str())
            .ignore()
            .expire(&server_key, self.ttl_secs as i64)
            .ignore()
            .query_async(&mut redis)
            .await?;

        info!(
            client_id = %conn.id,
            session_id = %conn.session_id,
            server_id = %conn.server_id,
            "Connection registered"
        );
        Ok(())
    }

    async fn unregister(&self, client_id: &ClientId) -> Result<()> {
        // The lookup discovers which session/server indices to clean up
        let record = self.get(client_id).await?;
        let mut redis = self.redis.clone();

        let _: () = redis::pipe()
            .atomic()
            .del(self.keys.conn(client_id))
            .ignore()
            .srem(self.keys.session_conns(&record.session_id), client_id.as_str())
            .ignore()
            .srem(self.keys.server_conns(&record.server_id), client_id.as_str())
            .ignore()
            .query_async(&mut redis)
            .await?;

        info!(
            client_id = %client_id,
            session_id = %record.session_id,
            "Connection unregistered"
        );
        Ok(())
    }

    async fn update_state(&self, client_id: &ClientId, state: ConnectionState) -> Result<()> {
        let mut record = self.get(client_id).await?;
        record.state = state;
        record.last_seen = Utc::now();
        self.write_record(&record).await
    }

    async fn touch(&self, client_id: &ClientId) -> Result<()> {
        let mut record = self.get(client_id).await?;
        record.last_seen = Utc::now();
        self.write_record(&record).await
    }

    async fn get(&self, client_id: &ClientId) -> Result<ClientConnection> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.get(self.keys.conn(client_id)).await?;
        let Some(payload) = payload else {
            return Err(Error::NotFound(format!("connection {client_id}")));
        };
        Ok(serde_json::from_str(&payload)?)
    }

    async fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<ClientConnection>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.keys.session_conns(session_id)).await?;
        if members.is_empty() {
            return Err(Error::NotFound(format!("session {session_id}")));
        }

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let client_id = ClientId::from_string(member);
            match self.get(&client_id).await {
                Ok(record) => records.push(record),
                // Index member whose record already expired; skip it, the
                // set's own TTL bounds the staleness
                Err(Error::NotFound(_)) => {
                    debug!(client_id = %client_id, "Skipping stale session index member");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn list_by_server(&self, server_id: &ServerId) -> Result<Vec<ClientConnection>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.keys.server_conns(server_id)).await?;
        if members.is_empty() {
            return Err(Error::NotFound(format!("server {server_id}")));
        }

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let client_id = ClientId::from_string(member);
            match self.get(&client_id).await {
                Ok(record) => records.push(record),
                Err(Error::NotFound(_)) => {
                    debug!(client_id = %client_id, "Skipping stale server index member");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn sweep_expired(
        &self,
        server_id: &ServerId,
        timeout: Duration,
    ) -> Result<Vec<ClientConnection>> {
        let records = match self.list_by_server(server_id).await {
            Ok(records) => records,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::Internal(format!("invalid sweep timeout: {e}")))?;
        let now = Utc::now();
        let mut swept = Vec::new();

        for record in records {
            if now.signed_duration_since(record.last_seen) > timeout {
                warn!(
                    client_id = %record.id,
                    session_id = %record.session_id,
                    last_seen = %record.last_seen,
                    "Sweeping expired connection"
                );
                match self.unregister(&record.id).await {
                    Ok(()) | Err(Error::NotFound(_)) => swept.push(record),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(swept)
    }
}

/// In-memory registry for single-instance deployments and tests.
///
/// Records expire only through the sweep; TTL-based lazy expiry is a
/// property of the Redis backend.
#[derive(Default)]
pub struct MemoryConnectionRegistry {
    records: RwLock<HashMap<ClientId, ClientConnection>>,
    by_session: RwLock<HashMap<SessionId, HashSet<ClientId>>>,
    by_server: RwLock<HashMap<ServerId, HashSet<ClientId>>>,
}

impl MemoryConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn register(&self, conn: &ClientConnection) -> Result<()> {
        self.records
            .write()
            .insert(conn.id.clone(), conn.clone());
        self.by_session
            .write()
            .entry(conn.session_id.clone())
            .or_default()
            .insert(conn.id.clone());
        self.by_server
            .write()
            .entry(conn.server_id.clone())
            .or_default()
            .insert(conn.id.clone());

        info!(
            client_id = %conn.id,
            session_id = %conn.session_id,
            server_id = %conn.server_id,
            "Connection registered"
        );
        Ok(())
    }

    async fn unregister(&self, client_id: &ClientId) -> Result<()> {
        let Some(record) = self.records.write().remove(client_id) else {
            return Err(Error::NotFound(format!("connection {client_id}")));
        };

        let mut by_session = self.by_session.write();
        if let Some(members) = by_session.get_mut(&record.session_id) {
            members.remove(client_id);
            if members.is_empty() {
                by_session.remove(&record.session_id);
            }
        }
        drop(by_session);

        let mut by_server = self.by_server.write();
        if let Some(members) = by_server.get_mut(&record.server_id) {
            members.remove(client_id);
            if members.is_empty() {
                by_server.remove(&record.server_id);
            }
        }

        info!(client_id = %client_id, "Connection unregistered");
        Ok(())
    }

    async fn update_state(&self, client_id: &ClientId, state: ConnectionState) -> Result<()> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(client_id) else {
            return Err(Error::NotFound(format!("connection {client_id}")));
        };
        record.state = state;
        record.last_seen = Utc::now();
        Ok(())
    }

    async fn touch(&self, client_id: &ClientId) -> Result<()> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(client_id) else {
            return Err(Error::NotFound(format!("connection {client_id}")));
        };
        record.last_seen = Utc::now();
        Ok(())
    }

    async fn get(&self, client_id: &ClientId) -> Result<ClientConnection> {
        self.records
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("connection {client_id}")))
    }

    async fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<ClientConnection>> {
        let by_session = self.by_session.read();
        let Some(members) = by_session.get(session_id) else {
            return Err(Error::NotFound(format!("session {session_id}")));
        };
        let records = self.records.read();
        Ok(members
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }

    async fn list_by_server(&self, server_id: &ServerId) -> Result<Vec<ClientConnection>> {
        let by_server = self.by_server.read();
        let Some(members) = by_server.get(server_id) else {
            return Err(Error::NotFound(format!("server {server_id}")));
        };
        let records = self.records.read();
        Ok(members
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }

    async fn sweep_expired(
        &self,
        server_id: &ServerId,
        timeout: Duration,
    ) -> Result<Vec<ClientConnection>> {
        let records = match self.list_by_server(server_id).await {
            Ok(records) => records,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::Internal(format!("invalid sweep timeout: {e}")))?;
        let now = Utc::now();
        let mut swept = Vec::new();

        for record in records {
            if now.signed_duration_since(record.last_seen) > timeout {
                warn!(
                    client_id = %record.id,
                    session_id = %record.session_id,
                    "Sweeping expired connection"
                );
                match self.unregister(&record.id).await {
                    Ok(()) | Err(Error::NotFound(_)) => swept.push(record),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(swept)
    }
}

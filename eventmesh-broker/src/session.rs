use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use eventmesh_core::models::{ClientId, SessionId};
use eventmesh_core::{Error, Result};

use crate::client::ClientHandle;
use crate::keys::Keys;

/// Holds the client handles this instance owns, indexed by client ID and by
/// session ID, so event delivery can find local targets without a store
/// round-trip.
///
/// Two interchangeable implementations: [`MemorySessionStore`] for
/// single-instance deployments and tests, [`RedisSessionStore`] for
/// deployments that want session membership in the distributed store. Both
/// give read-after-write within one instance.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_client(&self, id: ClientId, handle: ClientHandle) -> Result<()>;

    async fn get_client(&self, id: &ClientId) -> Result<ClientHandle>;

    async fn remove_client(&self, id: &ClientId) -> Result<()>;

    async fn add_client_to_session(&self, session_id: &SessionId, id: &ClientId) -> Result<()>;

    async fn remove_client_from_session(
        &self,
        session_id: &SessionId,
        id: &ClientId,
    ) -> Result<()>;

    /// Client IDs in the session. `NotFound` when the session has no
    /// clients, distinct from store failure.
    async fn session_clients(&self, session_id: &SessionId) -> Result<Vec<ClientId>>;

    /// Sessions with at least one client held by this instance
    async fn session_ids(&self) -> Vec<SessionId>;

    /// Number of handles held by this instance
    async fn client_count(&self) -> usize;
}

/// In-process session store.
///
/// One read/write lock per map, scoped to the whole store: lookups during
/// publish vastly outnumber attach/detach writes.
#[derive(Default)]
pub struct MemorySessionStore {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    sessions: RwLock<HashMap<SessionId, HashSet<ClientId>>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn add_client(&self, id: ClientId, handle: ClientHandle) -> Result<()> {
        self.clients.write().insert(id, handle);
        Ok(())
    }

    async fn get_client(&self, id: &ClientId) -> Result<ClientHandle> {
        self.clients
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("client {id}")))
    }

    async fn remove_client(&self, id: &ClientId) -> Result<()> {
        if self.clients.write().remove(id).is_none() {
            return Err(Error::NotFound(format!("client {id}")));
        }
        Ok(())
    }

    async fn add_client_to_session(&self, session_id: &SessionId, id: &ClientId) -> Result<()> {
        self.sessions
            .write()
            .entry(session_id.clone())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    async fn remove_client_from_session(
        &self,
        session_id: &SessionId,
        id: &ClientId,
    ) -> Result<()> {
        let mut sessions = self.sessions.write();
        if let Some(members) = sessions.get_mut(session_id) {
            members.remove(id);
            if members.is_empty() {
                sessions.remove(session_id);
                debug!(session_id = %session_id, "Session has no more clients, removed");
            }
        }
        Ok(())
    }

    async fn session_clients(&self, session_id: &SessionId) -> Result<Vec<ClientId>> {
        let sessions = self.sessions.read();
        let members = sessions
            .get(session_id)
            .filter(|members| !members.is_empty())
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        Ok(members.iter().cloned().collect())
    }

    async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    async fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

/// Session store that persists session membership in Redis while keeping
/// the (inherently process-local) client handles in memory.
pub struct RedisSessionStore {
    redis: redis::aio::ConnectionManager,
    keys: Keys,
    ttl_secs: u64,
    handles: DashMap<ClientId, ClientHandle>,
    /// Local mirror of session membership, for enumerating this instance's
    /// sessions without a store scan
    local_sessions: DashMap<SessionId, HashSet<ClientId>>,
}

impl RedisSessionStore {
    #[must_use]
    pub fn new(redis: redis::aio::ConnectionManager, keys: Keys, ttl_secs: u64) -> Self {
        Self {
            redis,
            keys,
            ttl_secs,
            handles: DashMap::new(),
            local_sessions: DashMap::new(),
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn add_client(&self, id: ClientId, handle: ClientHandle) -> Result<()> {
        self.handles.insert(id, handle);
        Ok(())
    }

    async fn get_client(&self, id: &ClientId) -> Result<ClientHandle> {
        self.handles
            .get(id)
            .map(|handle| handle.clone())
            .ok_or_else(|| Error::NotFound(format!("client {id}")))
    }

    async fn remove_client(&self, id: &ClientId) -> Result<()> {
        if self.handles.remove(id).is_none() {
            return Err(Error::NotFound(format!("client {id}")));
        }
        Ok(())
    }

    async fn add_client_to_session(&self, session_id: &SessionId, id: &ClientId) -> Result<()> {
        let key = self.keys.session_clients(session_id);
        let mut redis = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, id.as_str())
            .ignore()
            .expire(&key, self.ttl_secs as i64)
            .ignore()
            .query_async(&mut redis)
            .await?;

        self.local_sessions
            .entry(session_id.clone())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    async fn remove_client_from_session(
        &self,
        session_id: &SessionId,
        id: &ClientId,
    ) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .srem(self.keys.session_clients(session_id), id.as_str())
            .await?;

        if let Some(mut members) = self.local_sessions.get_mut(session_id) {
            members.remove(id);
            if members.is_empty() {
                drop(members);
                self.local_sessions.remove(session_id);
            }
        }
        Ok(())
    }

    async fn session_clients(&self, session_id: &SessionId) -> Result<Vec<ClientId>> {
        let mut redis = self.redis.clone();
        let members: Vec<String> = redis
            .smembers(self.keys.session_clients(session_id))
            .await?;
        if members.is_empty() {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        Ok(members.into_iter().map(ClientId::from_string).collect())
    }

    async fn session_ids(&self) -> Vec<SessionId> {
        self.local_sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn client_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for RedisSessionStore {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            warn!(
                handles = self.handles.len(),
                "Session store dropped with live client handles"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> (ClientId, ClientHandle) {
        let id = ClientId::from_string(id.to_string());
        let (handle, _rx) = ClientHandle::new(id.clone(), 4);
        (id, handle)
    }

    #[tokio::test]
    async fn test_add_get_remove_client() {
        let store = MemorySessionStore::new();
        let (id, handle) = client("c1");

        store.add_client(id.clone(), handle).await.unwrap();
        assert_eq!(store.get_client(&id).await.unwrap().id(), &id);
        assert_eq!(store.client_count().await, 1);

        store.remove_client(&id).await.unwrap();
        assert!(store.get_client(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_absent_client_is_not_found() {
        let store = MemorySessionStore::new();
        let err = store
            .remove_client(&ClientId::from_string("nope".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_session_membership() {
        let store = MemorySessionStore::new();
        let session = SessionId::from_string("s1".to_string());
        let (c1, h1) = client("c1");
        let (c2, h2) = client("c2");

        store.add_client(c1.clone(), h1).await.unwrap();
        store.add_client(c2.clone(), h2).await.unwrap();
        store.add_client_to_session(&session, &c1).await.unwrap();
        store.add_client_to_session(&session, &c2).await.unwrap();

        let mut members = store.session_clients(&session).await.unwrap();
        members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(members, vec![c1.clone(), c2.clone()]);
        assert_eq!(store.session_ids().await, vec![session.clone()]);

        store
            .remove_client_from_session(&session, &c1)
            .await
            .unwrap();
        assert_eq!(store.session_clients(&session).await.unwrap(), vec![c2]);
    }

    #[tokio::test]
    async fn test_empty_session_is_not_found() {
        let store = MemorySessionStore::new();
        let session = SessionId::from_string("s1".to_string());
        let (c1, h1) = client("c1");

        assert!(store
            .session_clients(&session)
            .await
            .unwrap_err()
            .is_not_found());

        store.add_client(c1.clone(), h1).await.unwrap();
        store.add_client_to_session(&session, &c1).await.unwrap();
        store
            .remove_client_from_session(&session, &c1)
            .await
            .unwrap();

        // Removing the last client drops the session entry entirely
        assert!(store
            .session_clients(&session)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.session_ids().await.is_empty());
    }
}

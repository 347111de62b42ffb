use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eventmesh_core::models::{ClientId, ServerId, SessionId};
use eventmesh_core::{Error, Result};

use crate::event::{Event, MembershipAction, MembershipUpdate};
use crate::keys::Keys;
use crate::pubsub::PubSubBackend;
use crate::registry::ConnectionRegistry;

/// Capability the broker supplies so the event bus can reach the client
/// handles this instance holds without depending on the broker itself.
///
/// All delivery is a non-blocking enqueue; a full queue sheds the event.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// Hand to one locally-held client's queue. Returns false only when
    /// this instance does not hold the client; a full queue sheds the
    /// event and still counts as handled.
    async fn deliver_to_client(&self, client_id: &ClientId, event: Event) -> bool;

    /// Deliver to every locally-held client of the session, continuing past
    /// individual failures. Returns the number of queues reached.
    async fn deliver_to_session(&self, session_id: &SessionId, event: Event) -> usize;

    async fn has_local_clients(&self, session_id: &SessionId) -> bool;
}

/// The distributed pub/sub fan-out layer.
///
/// Every publish tries the local fast path first; the distributed store is
/// only touched for clients held elsewhere, and for session publishes only
/// when the cached membership set names another instance. Steady-state
/// publishes to sessions whose clients are all colocated with the publisher
/// therefore pay no store round-trip.
pub struct EventBus {
    backend: Arc<dyn PubSubBackend>,
    local: Arc<dyn LocalDelivery>,
    registry: Arc<dyn ConnectionRegistry>,
    server_id: ServerId,
    keys: Keys,
    /// Active channel subscriptions; inserting for an existing channel
    /// cancels the listener it replaces
    subscriptions: DashMap<String, CancellationToken>,
    /// Cached per-session membership: which server instances currently own
    /// clients for the session. Reconciled on subscribe, updated
    /// incrementally from the membership channel.
    members: Arc<DashMap<SessionId, HashSet<ServerId>>>,
}

impl EventBus {
    #[must_use]
    pub fn new(
        backend: Arc<dyn PubSubBackend>,
        local: Arc<dyn LocalDelivery>,
        registry: Arc<dyn ConnectionRegistry>,
        server_id: ServerId,
        keys: Keys,
    ) -> Self {
        Self {
            backend,
            local,
            registry,
            server_id,
            keys,
            subscriptions: DashMap::new(),
            members: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Whether any instance other than this one owns clients for the session
    #[must_use]
    pub fn has_remote_members(&self, session_id: &SessionId) -> bool {
        self.members
            .get(session_id)
            .is_some_and(|servers| servers.iter().any(|id| id != &self.server_id))
    }

    /// Deliver to a single client: local fast path when this instance holds
    /// the handle (a full queue sheds the event there), otherwise one
    /// publish on the client-scoped channel that the owning instance is
    /// subscribed to.
    pub async fn publish_to_client(&self, client_id: &ClientId, event: Event) -> Result<bool> {
        if self.local.deliver_to_client(client_id, event.clone()).await {
            return Ok(true);
        }

        let mut event = event;
        event.origin_server_id = self.server_id.clone();
        let payload = serde_json::to_string(&event)?;
        let reached = self
            .backend
            .publish(&self.keys.client_channel(client_id), payload)
            .await?;
        debug!(
            client_id = %client_id,
            reached = reached,
            "Event published on client channel"
        );
        Ok(false)
    }

    /// Deliver to all clients of a session: local fan-out first, then one
    /// publish on the session channel only if the session has known remote
    /// membership. Returns the local delivery count.
    pub async fn publish_to_session(&self, session_id: &SessionId, event: Event) -> Result<usize> {
        let mut event = event;
        event.origin_server_id = self.server_id.clone();

        let local_sent = self
            .local
            .deliver_to_session(session_id, event.clone())
            .await;

        if self.has_remote_members(session_id) {
            let payload = serde_json::to_string(&event)?;
            let reached = self
                .backend
                .publish(&self.keys.session_channel(session_id), payload)
                .await?;
            debug!(
                session_id = %session_id,
                local_sent = local_sent,
                remote_subscribers = reached,
                "Event published on session channel"
            );
        }

        Ok(local_sent)
    }

    /// Subscribe to the client-scoped channel, replacing any previous
    /// subscription for the same client
    pub async fn subscribe_client(&self, client_id: &ClientId) -> Result<()> {
        let channel = self.keys.client_channel(client_id);
        let sub = self.backend.subscribe(&channel).await?;
        let token = CancellationToken::new();

        let local = Arc::clone(&self.local);
        let client_id = client_id.clone();
        let task_channel = channel.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut sub = sub;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        sub.cancel();
                        return;
                    }
                    payload = sub.next() => {
                        let Some(payload) = payload else { return };
                        match serde_json::from_str::<Event>(&payload) {
                            Ok(event) => {
                                if !local.deliver_to_client(&client_id, event).await {
                                    debug!(
                                        client_id = %client_id,
                                        "Client gone, dropping remotely published event"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    channel = %task_channel,
                                    "Failed to deserialize event, skipping"
                                );
                            }
                        }
                    }
                }
            }
        });

        self.replace_subscription(channel, token);
        Ok(())
    }

    /// Subscribe to the session's event and membership channels, replacing
    /// any previous subscriptions for the same session.
    ///
    /// Performs an initial membership reconciliation against the registry so
    /// the remote-membership flag is correct before any incremental update
    /// arrives.
    pub async fn subscribe_session(&self, session_id: &SessionId) -> Result<()> {
        let servers: HashSet<ServerId> = match self.registry.list_by_session(session_id).await {
            Ok(records) => records.into_iter().map(|record| record.server_id).collect(),
            Err(Error::NotFound(_)) => HashSet::new(),
            Err(e) => return Err(e),
        };
        debug!(
            session_id = %session_id,
            servers = servers.len(),
            "Reconciled session membership"
        );
        self.members.insert(session_id.clone(), servers);

        self.spawn_session_listener(session_id).await?;
        self.spawn_membership_listener(session_id).await?;
        Ok(())
    }

    async fn spawn_session_listener(&self, session_id: &SessionId) -> Result<()> {
        let channel = self.keys.session_channel(session_id);
        let sub = self.backend.subscribe(&channel).await?;
        let token = CancellationToken::new();

        let local = Arc::clone(&self.local);
        let server_id = self.server_id.clone();
        let session_id = session_id.clone();
        let task_channel = channel.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut sub = sub;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        sub.cancel();
                        return;
                    }
                    payload = sub.next() => {
                        let Some(payload) = payload else { return };
                        match serde_json::from_str::<Event>(&payload) {
                            Ok(event) => {
                                // This instance already delivered its own
                                // events on the local fast path
                                if event.origin_server_id == server_id {
                                    debug!(
                                        session_id = %session_id,
                                        "Ignoring event echo from self"
                                    );
                                    continue;
                                }
                                let delivered = local
                                    .deliver_to_session(&session_id, event)
                                    .await;
                                debug!(
                                    session_id = %session_id,
                                    delivered = delivered,
                                    "Forwarded remote event to local clients"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    channel = %task_channel,
                                    "Failed to deserialize event, skipping"
                                );
                            }
                        }
                    }
                }
            }
        });

        self.replace_subscription(channel, token);
        Ok(())
    }

    async fn spawn_membership_listener(&self, session_id: &SessionId) -> Result<()> {
        let channel = self.keys.membership_channel(session_id);
        let sub = self.backend.subscribe(&channel).await?;
        let token = CancellationToken::new();

        let members = Arc::clone(&self.members);
        let server_id = self.server_id.clone();
        let task_channel = channel.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut sub = sub;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        sub.cancel();
                        return;
                    }
                    payload = sub.next() => {
                        let Some(payload) = payload else { return };
                        match serde_json::from_str::<MembershipUpdate>(&payload) {
                            Ok(update) => {
                                if update.server_id == server_id {
                                    continue;
                                }
                                match update.action {
                                    MembershipAction::Joined => {
                                        members
                                            .entry(update.session_id.clone())
                                            .or_default()
                                            .insert(update.server_id.clone());
                                        debug!(
                                            session_id = %update.session_id,
                                            server_id = %update.server_id,
                                            "Instance joined session"
                                        );
                                    }
                                    MembershipAction::Left => {
                                        if let Some(mut servers) =
                                            members.get_mut(&update.session_id)
                                        {
                                            servers.remove(&update.server_id);
                                        }
                                        debug!(
                                            session_id = %update.session_id,
                                            server_id = %update.server_id,
                                            "Instance left session"
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    channel = %task_channel,
                                    "Failed to deserialize membership update, skipping"
                                );
                            }
                        }
                    }
                }
            }
        });

        self.replace_subscription(channel, token);
        Ok(())
    }

    /// Tell other instances this one gained or lost clients for a session
    pub async fn announce_membership(
        &self,
        session_id: &SessionId,
        action: MembershipAction,
    ) -> Result<()> {
        let update = MembershipUpdate {
            session_id: session_id.clone(),
            server_id: self.server_id.clone(),
            action,
        };
        let payload = serde_json::to_string(&update)?;
        self.backend
            .publish(&self.keys.membership_channel(session_id), payload)
            .await?;
        Ok(())
    }

    pub fn unsubscribe_client(&self, client_id: &ClientId) {
        self.cancel_subscription(&self.keys.client_channel(client_id));
    }

    /// Tear down the session's subscriptions and cached membership, but only
    /// when this instance no longer holds any client for it. Avoids
    /// resubscription churn on quick disconnect/reconnect cycles.
    pub async fn unsubscribe_session_if_no_local_clients(&self, session_id: &SessionId) -> bool {
        if self.local.has_local_clients(session_id).await {
            return false;
        }

        self.cancel_subscription(&self.keys.session_channel(session_id));
        self.cancel_subscription(&self.keys.membership_channel(session_id));
        self.members.remove(session_id);
        debug!(session_id = %session_id, "Unsubscribed from session channels");
        true
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Cancel every listener task
    pub fn shutdown(&self) {
        info!("Shutting down event bus");
        for entry in self.subscriptions.iter() {
            entry.value().cancel();
        }
        self.subscriptions.clear();
        self.members.clear();
    }

    fn replace_subscription(&self, channel: String, token: CancellationToken) {
        if let Some(previous) = self.subscriptions.insert(channel, token) {
            previous.cancel();
        }
    }

    fn cancel_subscription(&self, channel: &str) {
        if let Some((_, token)) = self.subscriptions.remove(channel) {
            token.cancel();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{MemoryPubSubBackend, Subscription};
    use crate::registry::{ClientConnection, MemoryConnectionRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    /// Backend wrapper that counts publishes per channel
    struct CountingBackend {
        inner: MemoryPubSubBackend,
        published: DashMap<String, usize>,
        total: AtomicUsize,
    }

    impl CountingBackend {
        fn new(inner: MemoryPubSubBackend) -> Self {
            Self {
                inner,
                published: DashMap::new(),
                total: AtomicUsize::new(0),
            }
        }

        fn published_on(&self, channel: &str) -> usize {
            self.published.get(channel).map_or(0, |count| *count)
        }
    }

    #[async_trait]
    impl PubSubBackend for CountingBackend {
        async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
            *self.published.entry(channel.to_string()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::Relaxed);
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription> {
            self.inner.subscribe(channel).await
        }
    }

    fn server(id: &str) -> ServerId {
        ServerId::from_string(id.to_string())
    }

    fn session(id: &str) -> SessionId {
        SessionId::from_string(id.to_string())
    }

    fn client(id: &str) -> ClientId {
        ClientId::from_string(id.to_string())
    }

    #[tokio::test]
    async fn test_solo_session_publish_skips_backend() {
        let backend = Arc::new(CountingBackend::new(MemoryPubSubBackend::new()));
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local.expect_deliver_to_session().returning(|_, _| 1);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s2 = session("s2");
        for _ in 0..5 {
            let sent = bus
                .publish_to_session(&s2, Event::new("token", json!("t")))
                .await
                .unwrap();
            assert_eq!(sent, 1);
        }

        // No remote membership: the distributed channel is never touched
        assert_eq!(backend.published_on(&Keys::default().session_channel(&s2)), 0);
        assert_eq!(backend.total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_remote_membership_gates_backend_publish() {
        let backend = Arc::new(CountingBackend::new(MemoryPubSubBackend::new()));
        let registry = Arc::new(MemoryConnectionRegistry::new());

        // Another instance owns a client in the session
        registry
            .register(&ClientConnection::new(
                client("y"),
                session("s1"),
                server("srv-b"),
            ))
            .await
            .unwrap();

        let mut local = MockLocalDelivery::new();
        local.expect_deliver_to_session().returning(|_, _| 1);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s1 = session("s1");
        bus.subscribe_session(&s1).await.unwrap();
        assert!(bus.has_remote_members(&s1));

        bus.publish_to_session(&s1, Event::new("token", json!("t")))
            .await
            .unwrap();

        assert_eq!(backend.published_on(&Keys::default().session_channel(&s1)), 1);
    }

    #[tokio::test]
    async fn test_self_suppression_on_session_channel() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        // An echo of this instance's own event must never be redelivered
        local.expect_deliver_to_session().never();

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s1 = session("s1");
        bus.subscribe_session(&s1).await.unwrap();

        let mut echo = Event::new("token", json!("t"));
        echo.origin_server_id = server("srv-a");
        backend
            .publish(
                &Keys::default().session_channel(&s1),
                serde_json::to_string(&echo).unwrap(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_remote_event_is_delivered_locally() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local
            .expect_deliver_to_session()
            .times(1)
            .returning(|_, _| 1);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s1 = session("s1");
        bus.subscribe_session(&s1).await.unwrap();

        let mut event = Event::new("token", json!("t"));
        event.origin_server_id = server("srv-b");
        backend
            .publish(
                &Keys::default().session_channel(&s1),
                serde_json::to_string(&event).unwrap(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local
            .expect_deliver_to_session()
            .times(1)
            .returning(|_, _| 1);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s1 = session("s1");
        bus.subscribe_session(&s1).await.unwrap();
        let channel = Keys::default().session_channel(&s1);

        // Garbage first; the listener logs and continues
        backend
            .publish(&channel, "not json".to_string())
            .await
            .unwrap();

        let mut event = Event::new("token", json!("t"));
        event.origin_server_id = server("srv-b");
        backend
            .publish(&channel, serde_json::to_string(&event).unwrap())
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_membership_update_flips_remote_flag() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local.expect_deliver_to_session().returning(|_, _| 0);

        let bus_a = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry.clone(),
            server("srv-a"),
            Keys::default(),
        );

        let s1 = session("s1");
        bus_a.subscribe_session(&s1).await.unwrap();
        assert!(!bus_a.has_remote_members(&s1));

        // Another instance announces that it now holds clients for s1
        let mut local_b = MockLocalDelivery::new();
        local_b.expect_deliver_to_session().returning(|_, _| 0);
        let bus_b = EventBus::new(
            backend.clone(),
            Arc::new(local_b),
            registry,
            server("srv-b"),
            Keys::default(),
        );
        bus_b
            .announce_membership(&s1, MembershipAction::Joined)
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(bus_a.has_remote_members(&s1));

        bus_b
            .announce_membership(&s1, MembershipAction::Left)
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!bus_a.has_remote_members(&s1));
    }

    #[tokio::test]
    async fn test_unsubscribe_session_only_when_empty() {
        let backend = Arc::new(MemoryPubSubBackend::new());
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        let mut seq = mockall::Sequence::new();
        local
            .expect_has_local_clients()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| true);
        local
            .expect_has_local_clients()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| false);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let s3 = session("s3");
        bus.subscribe_session(&s3).await.unwrap();
        assert_eq!(bus.subscription_count(), 2);

        // A client remains: subscriptions stay up
        assert!(!bus.unsubscribe_session_if_no_local_clients(&s3).await);
        assert_eq!(bus.subscription_count(), 2);

        // Last client gone: both channels torn down
        assert!(bus.unsubscribe_session_if_no_local_clients(&s3).await);
        assert_eq!(bus.subscription_count(), 0);

        // The backend no longer reaches any subscriber for the session
        sleep(Duration::from_millis(50)).await;
        let reached = backend
            .publish(
                &Keys::default().session_channel(&s3),
                "{}".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_publish_to_client_prefers_local_fast_path() {
        let backend = Arc::new(CountingBackend::new(MemoryPubSubBackend::new()));
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local
            .expect_deliver_to_client()
            .times(1)
            .returning(|_, _| true);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let delivered_locally = bus
            .publish_to_client(&client("x"), Event::new("token", json!("t")))
            .await
            .unwrap();
        assert!(delivered_locally);
        assert_eq!(backend.total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_client_goes_remote() {
        let backend = Arc::new(CountingBackend::new(MemoryPubSubBackend::new()));
        let registry = Arc::new(MemoryConnectionRegistry::new());

        let mut local = MockLocalDelivery::new();
        local
            .expect_deliver_to_client()
            .times(1)
            .returning(|_, _| false);

        let bus = EventBus::new(
            backend.clone(),
            Arc::new(local),
            registry,
            server("srv-a"),
            Keys::default(),
        );

        let x = client("x");
        let delivered_locally = bus
            .publish_to_client(&x, Event::new("token", json!("t")))
            .await
            .unwrap();
        assert!(!delivered_locally);
        assert_eq!(
            backend.published_on(&Keys::default().client_channel(&x)),
            1
        );
    }
}

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eventmesh_core::config::Config;
use eventmesh_core::models::{ClientId, ServerId, SessionId};
use eventmesh_core::{Error, Result};

use crate::bus::{EventBus, LocalDelivery};
use crate::client::{ClientHandle, EnqueueOutcome};
use crate::event::{Event, MembershipAction};
use crate::keys::Keys;
use crate::pubsub::{MemoryPubSubBackend, PubSubBackend, RedisPubSubBackend};
use crate::registry::{
    ClientConnection, ConnectionRegistry, MemoryConnectionRegistry, RedisConnectionRegistry,
};
use crate::session::{MemorySessionStore, RedisSessionStore, SessionStore};
use crate::sse::{format_event, EventSink};

/// Adapts the session store's client handles to the delivery capability the
/// event bus consumes. A client is "local" when this instance holds its
/// handle.
pub struct LocalClientProvider {
    sessions: Arc<dyn SessionStore>,
}

impl LocalClientProvider {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl LocalDelivery for LocalClientProvider {
    async fn deliver_to_client(&self, client_id: &ClientId, event: Event) -> bool {
        match self.sessions.get_client(client_id).await {
            // A held handle resolves the delivery locally whatever the
            // enqueue outcome: a full queue sheds the event, and a closed
            // one means the client is detaching here. Falling through to
            // the client channel would loop the event back to this same
            // instance and deliver it late.
            Ok(handle) => {
                handle.try_enqueue(event);
                true
            }
            Err(Error::NotFound(_)) => false,
            Err(e) => {
                warn!(error = %e, client_id = %client_id, "Client lookup failed");
                false
            }
        }
    }

    async fn deliver_to_session(&self, session_id: &SessionId, event: Event) -> usize {
        let members = match self.sessions.session_clients(session_id).await {
            Ok(members) => members,
            Err(Error::NotFound(_)) => return 0,
            Err(e) => {
                warn!(error = %e, session_id = %session_id, "Session lookup failed");
                return 0;
            }
        };

        let mut delivered = 0;
        for client_id in members {
            // Membership may name clients held by other instances; only
            // locally-resolvable handles count
            match self.sessions.get_client(&client_id).await {
                Ok(handle) => {
                    if handle.try_enqueue(event.clone()) == EnqueueOutcome::Delivered {
                        delivered += 1;
                    }
                }
                Err(Error::NotFound(_)) => {}
                Err(e) => {
                    warn!(error = %e, client_id = %client_id, "Client lookup failed");
                }
            }
        }
        delivered
    }

    async fn has_local_clients(&self, session_id: &SessionId) -> bool {
        let members = match self.sessions.session_clients(session_id).await {
            Ok(members) => members,
            Err(_) => return false,
        };
        for client_id in members {
            if self.sessions.get_client(&client_id).await.is_ok() {
                return true;
            }
        }
        false
    }
}

/// Point-in-time operational counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct BrokerMetrics {
    pub server_id: ServerId,
    pub local_clients: usize,
    pub local_sessions: usize,
    pub active_subscriptions: usize,
}

/// The per-instance façade over the registry, session store, and event bus.
///
/// Transports attach clients here and drive their streams; publishers hand
/// events to `publish*` and never learn where the clients live.
pub struct Broker {
    server_id: ServerId,
    sessions: Arc<dyn SessionStore>,
    registry: Arc<dyn ConnectionRegistry>,
    bus: Arc<EventBus>,
    queue_capacity: usize,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
}

impl Broker {
    #[must_use]
    pub fn new(
        server_id: ServerId,
        sessions: Arc<dyn SessionStore>,
        registry: Arc<dyn ConnectionRegistry>,
        backend: Arc<dyn PubSubBackend>,
        keys: Keys,
        queue_capacity: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        let local = Arc::new(LocalClientProvider::new(Arc::clone(&sessions)));
        let bus = Arc::new(EventBus::new(
            backend,
            local,
            Arc::clone(&registry),
            server_id.clone(),
            keys,
        ));
        Self {
            server_id,
            sessions,
            registry,
            bus,
            queue_capacity,
            heartbeat_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a broker from configuration. An empty Redis URL selects the
    /// in-memory backends, for single-instance deployments.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let server_id = config.server.server_id();
        let keys = Keys::new(config.redis.key_prefix.clone());
        let queue_capacity = config.broker.queue_capacity;
        let heartbeat_interval = Duration::from_secs(config.broker.heartbeat_interval_secs);
        let ttl_secs = config.broker.connection_ttl_secs;

        if config.redis.url.is_empty() {
            warn!(
                server_id = %server_id,
                "No Redis URL configured, running in single-instance mode"
            );
            return Ok(Self::new(
                server_id,
                Arc::new(MemorySessionStore::new()),
                Arc::new(MemoryConnectionRegistry::new()),
                Arc::new(MemoryPubSubBackend::new()),
                keys,
                queue_capacity,
                heartbeat_interval,
            ));
        }

        let client = redis::Client::open(config.redis.url.as_str())?;
        let redis = redis::aio::ConnectionManager::new(client).await?;
        let backend = RedisPubSubBackend::connect(&config.redis.url).await?;

        info!(server_id = %server_id, "Connected to Redis");
        Ok(Self::new(
            server_id,
            Arc::new(RedisSessionStore::new(redis.clone(), keys.clone(), ttl_secs)),
            Arc::new(RedisConnectionRegistry::new(redis, keys.clone(), ttl_secs)),
            Arc::new(backend),
            keys,
            queue_capacity,
            heartbeat_interval,
        ))
    }

    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Attach a client: create its handle and queue, register ownership,
    /// subscribe the instance to the client and session channels, announce
    /// membership, and start the heartbeat. Returns the handle and the
    /// receiver the transport drains.
    pub async fn new_client(
        &self,
        client_id: ClientId,
        session_id: SessionId,
    ) -> Result<(ClientHandle, mpsc::Receiver<Event>)> {
        let (handle, rx) = ClientHandle::new(client_id.clone(), self.queue_capacity);

        self.sessions
            .add_client(client_id.clone(), handle.clone())
            .await?;
        self.sessions
            .add_client_to_session(&session_id, &client_id)
            .await?;
        self.registry
            .register(&ClientConnection::new(
                client_id.clone(),
                session_id.clone(),
                self.server_id.clone(),
            ))
            .await?;

        self.bus.subscribe_client(&client_id).await?;
        self.bus.subscribe_session(&session_id).await?;
        // Idempotent at the receivers, so announcing every attach is safe
        self.bus
            .announce_membership(&session_id, MembershipAction::Joined)
            .await?;

        self.spawn_heartbeat(handle.clone());

        info!(
            client_id = %client_id,
            session_id = %session_id,
            "Client attached"
        );
        Ok((handle, rx))
    }

    /// Detach a client, releasing everything its attach acquired.
    /// Idempotent: detaching an already-detached client is a no-op.
    pub async fn remove_client(&self, client_id: &ClientId, session_id: &SessionId) -> Result<()> {
        if let Ok(handle) = self.sessions.get_client(client_id).await {
            handle.close();
        }

        if let Err(e) = self.sessions.remove_client(client_id).await {
            if !e.is_not_found() {
                return Err(e);
            }
        }
        self.sessions
            .remove_client_from_session(session_id, client_id)
            .await?;

        match self.registry.unregister(client_id).await {
            Ok(()) => {}
            // Already expired or swept; nothing left to release
            Err(Error::NotFound(_)) => {
                debug!(client_id = %client_id, "Connection already unregistered");
            }
            Err(e) => return Err(e),
        }

        self.bus.unsubscribe_client(client_id);
        if self
            .bus
            .unsubscribe_session_if_no_local_clients(session_id)
            .await
        {
            self.bus
                .announce_membership(session_id, MembershipAction::Left)
                .await?;
        }

        info!(client_id = %client_id, session_id = %session_id, "Client detached");
        Ok(())
    }

    /// Publish to every client of a session, everywhere. Returns the number
    /// of local deliveries.
    pub async fn publish(&self, session_id: &SessionId, event: Event) -> Result<usize> {
        self.bus.publish_to_session(session_id, event).await
    }

    /// Publish to one client, wherever it is attached. Returns whether the
    /// client was handled on this instance.
    pub async fn publish_to_client(&self, client_id: &ClientId, event: Event) -> Result<bool> {
        self.bus.publish_to_client(client_id, event).await
    }

    /// Publish to every session with clients on this instance, continuing
    /// past per-session failures. Returns the total local delivery count.
    pub async fn publish_to_all(&self, event: Event) -> Result<usize> {
        let mut delivered = 0;
        for session_id in self.sessions.session_ids().await {
            match self.publish(&session_id, event.clone()).await {
                Ok(count) => delivered += count,
                Err(e) => {
                    warn!(
                        error = %e,
                        session_id = %session_id,
                        "Broadcast to session failed, continuing"
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Drive one client's stream: write the connection-established frame,
    /// then forward queued events to the sink until the done-signal fires or
    /// the transport fails. The caller detaches the client afterwards.
    pub async fn run_stream<S: EventSink>(
        &self,
        handle: &ClientHandle,
        mut rx: mpsc::Receiver<Event>,
        sink: &mut S,
    ) -> Result<()> {
        let result = self.stream_loop(handle, &mut rx, sink).await;
        // Whatever ended the stream, the done-signal stops the heartbeat
        handle.close();
        result
    }

    async fn stream_loop<S: EventSink>(
        &self,
        handle: &ClientHandle,
        rx: &mut mpsc::Receiver<Event>,
        sink: &mut S,
    ) -> Result<()> {
        sink.send(format_event(&Event::connection_established()))
            .await?;

        let done = handle.done();
        loop {
            tokio::select! {
                _ = done.cancelled() => {
                    debug!(client_id = %handle.id(), "Stream closed by done-signal");
                    return Ok(());
                }
                _ = self.shutdown.cancelled() => {
                    debug!(client_id = %handle.id(), "Stream closed by broker shutdown");
                    return Ok(());
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!(client_id = %handle.id(), "Event queue closed");
                        return Ok(());
                    };
                    if let Err(e) = sink.send(format_event(&event)).await {
                        debug!(
                            error = %e,
                            client_id = %handle.id(),
                            "Transport write failed, ending stream"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Start the periodic reclamation of connections whose heartbeats have
    /// stopped without a graceful detach
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, timeout: Duration) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = broker.shutdown.cancelled() => {
                        debug!("Sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match broker.registry.sweep_expired(&broker.server_id, timeout).await {
                            Ok(swept) => {
                                for record in swept {
                                    broker.reclaim_local(&record).await;
                                }
                            }
                            Err(e) => warn!(error = %e, "Expiry sweep failed"),
                        }
                    }
                }
            }
        });
    }

    /// Release the local state of a connection the sweep already
    /// unregistered
    async fn reclaim_local(&self, record: &ClientConnection) {
        if let Ok(handle) = self.sessions.get_client(&record.id).await {
            handle.close();
        }
        if let Err(e) = self.sessions.remove_client(&record.id).await {
            if !e.is_not_found() {
                warn!(error = %e, client_id = %record.id, "Failed to remove swept client");
            }
        }
        if let Err(e) = self
            .sessions
            .remove_client_from_session(&record.session_id, &record.id)
            .await
        {
            warn!(error = %e, client_id = %record.id, "Failed to remove swept session member");
        }

        self.bus.unsubscribe_client(&record.id);
        if self
            .bus
            .unsubscribe_session_if_no_local_clients(&record.session_id)
            .await
        {
            if let Err(e) = self
                .bus
                .announce_membership(&record.session_id, MembershipAction::Left)
                .await
            {
                warn!(error = %e, session_id = %record.session_id, "Failed to announce departure");
            }
        }
    }

    fn spawn_heartbeat(&self, handle: ClientHandle) {
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let done = handle.done();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if handle.try_enqueue(Event::ping()) == EnqueueOutcome::Closed {
                            debug!(client_id = %handle.id(), "Heartbeat found queue closed");
                            return;
                        }
                        match registry.touch(handle.id()).await {
                            Ok(()) => {}
                            // Record expired between beats; the sweep or the
                            // transport teardown owns the cleanup
                            Err(Error::NotFound(_)) => {
                                debug!(client_id = %handle.id(), "Heartbeat found no registry record");
                            }
                            Err(e) => {
                                warn!(error = %e, client_id = %handle.id(), "Heartbeat touch failed");
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn metrics(&self) -> BrokerMetrics {
        BrokerMetrics {
            server_id: self.server_id.clone(),
            local_clients: self.sessions.client_count().await,
            local_sessions: self.sessions.session_ids().await.len(),
            active_subscriptions: self.bus.subscription_count(),
        }
    }

    /// Stop background tasks and listener subscriptions. Attached clients'
    /// streams end; their registry records expire by TTL or sweep.
    pub fn shutdown(&self) {
        info!(server_id = %self.server_id, "Broker shutting down");
        self.shutdown.cancel();
        self.bus.shutdown();
    }
}

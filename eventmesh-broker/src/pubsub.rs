use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eventmesh_core::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Buffer between a subscription's feed task and its consumer
const SUBSCRIPTION_BUFFER: usize = 1024;

/// An open subscription to one channel. Payloads arrive in publish order;
/// cancelling stops the feed task.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    token: CancellationToken,
}

impl Subscription {
    /// Next raw payload, or `None` once the feed has shut down
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The distributed store's pub/sub surface, as the event bus consumes it.
///
/// [`RedisPubSubBackend`] is the multi-instance implementation;
/// [`MemoryPubSubBackend`] keeps everything in-process for single-instance
/// deployments and tests.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish a payload; returns the number of subscribers it reached
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Open a subscription to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Redis pub/sub backend.
///
/// Publishes over a shared multiplexed connection; each subscription gets a
/// dedicated pub/sub connection whose feed task reconnects with exponential
/// backoff if Redis drops it.
pub struct RedisPubSubBackend {
    client: redis::Client,
    publish_conn: redis::aio::ConnectionManager,
}

impl RedisPubSubBackend {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSubBackend {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let mut conn = self.publish_conn.clone();
        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, payload),
        )
        .await
        .map_err(|_| Error::Internal(format!("Timed out publishing to {channel}")))??;
        Ok(subscribers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let token = CancellationToken::new();

        let client = self.client.clone();
        let channel = channel.to_string();
        let task_token = token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if task_token.is_cancelled() {
                    return;
                }

                match open_pubsub(&client, &channel).await {
                    Ok(pubsub) => {
                        info!(channel = %channel, "Subscription connected");
                        backoff_secs = INITIAL_BACKOFF_SECS;

                        let mut stream = pubsub.into_on_message();
                        loop {
                            tokio::select! {
                                _ = task_token.cancelled() => {
                                    debug!(channel = %channel, "Subscription cancelled");
                                    return;
                                }
                                msg = stream.next() => {
                                    let Some(msg) = msg else {
                                        // Redis connection lost; reconnect
                                        error!(channel = %channel, "Subscription stream ended, reconnecting");
                                        break;
                                    };
                                    match msg.get_payload::<String>() {
                                        Ok(payload) => {
                                            if tx.send(payload).await.is_err() {
                                                // Consumer gone
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            warn!(error = %e, channel = %channel, "Invalid payload, skipping");
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            channel = %channel,
                            backoff_secs = backoff_secs,
                            "Failed to open subscription, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(Subscription { rx, token })
    }
}

async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub> {
    let mut pubsub = timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_async_pubsub(),
    )
    .await
    .map_err(|_| Error::Internal("Timed out getting Redis pub/sub connection".to_string()))??;

    timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        pubsub.subscribe(channel),
    )
    .await
    .map_err(|_| Error::Internal(format!("Timed out subscribing to {channel}")))??;

    Ok(pubsub)
}

/// In-process pub/sub backend: a channel map shared by every broker handle
/// cloned from it. Closed subscribers are pruned on publish.
#[derive(Clone, Default)]
pub struct MemoryPubSubBackend {
    channels: Arc<DashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryPubSubBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubBackend for MemoryPubSubBackend {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let Some(mut senders) = self.channels.get_mut(channel) else {
            return Ok(0);
        };

        let mut sent = 0;
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel = %channel, "Subscriber buffer full, dropping payload");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(sent)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription {
            rx,
            token: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_publish_reaches_subscribers() {
        let backend = MemoryPubSubBackend::new();
        let mut sub = backend.subscribe("chan:a").await.unwrap();

        let reached = backend
            .publish("chan:a", "payload".to_string())
            .await
            .unwrap();
        assert_eq!(reached, 1);
        assert_eq!(sub.next().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_memory_publish_without_subscribers() {
        let backend = MemoryPubSubBackend::new();
        let reached = backend
            .publish("chan:none", "payload".to_string())
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_memory_channels_are_isolated() {
        let backend = MemoryPubSubBackend::new();
        let mut sub_a = backend.subscribe("chan:a").await.unwrap();
        let _sub_b = backend.subscribe("chan:b").await.unwrap();

        backend.publish("chan:a", "for-a".to_string()).await.unwrap();
        assert_eq!(sub_a.next().await.unwrap(), "for-a");
    }

    #[tokio::test]
    async fn test_memory_prunes_dropped_subscribers() {
        let backend = MemoryPubSubBackend::new();
        {
            let _sub = backend.subscribe("chan:a").await.unwrap();
        }

        let reached = backend
            .publish("chan:a", "payload".to_string())
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_redis_publish_subscribe() {
        let backend = RedisPubSubBackend::connect("redis://127.0.0.1:6379")
            .await
            .unwrap();
        let mut sub = backend.subscribe("eventmesh:test:chan").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        backend
            .publish("eventmesh:test:chan", "hello".to_string())
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "hello");
    }
}

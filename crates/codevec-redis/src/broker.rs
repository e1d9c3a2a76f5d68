//! Pub/sub broadcast channels.
//!
//! A channel is an ephemeral, named topic owned by the broker: a message is
//! delivered to whoever is subscribed at publish time and is never replayed.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::debug;

use crate::client::{RedisError, RedisPool, RedisResult};

/// Publish side of the broker, plus the factory for subscriptions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one UTF-8 payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> RedisResult<()>;

    /// Open a dedicated link and subscribe it to a channel.
    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>>;
}

/// A live subscription to exactly one channel.
#[async_trait]
pub trait Subscription: Send {
    /// The subscribed channel name.
    fn channel(&self) -> &str;

    /// Wait at most `wait` for the next payload.
    ///
    /// `Ok(None)` means the wait elapsed with nothing to deliver. An error
    /// means the link is unusable and the subscription must be replaced.
    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<String>>;

    /// Release the broker-side subscription.
    async fn unsubscribe(&mut self) -> RedisResult<()>;
}

/// Redis-backed broker. Publishes go through the shared connection manager;
/// each subscription gets its own pub/sub connection.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    pool: RedisPool,
}

impl RedisBroker {
    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let pool = RedisPool::new(client.clone()).await?;
        Ok(Self { client, pool })
    }

    /// Round-trip a PING on the publish connection.
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.pool.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> RedisResult<()> {
        let mut conn = self.pool.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "Subscribed to Redis channel");
        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            pubsub,
        }))
    }
}

struct RedisSubscription {
    channel: String,
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<String>> {
        let mut messages = self.pubsub.on_message();
        match tokio::time::timeout(wait, messages.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(RedisError::LinkLost(format!(
                "pub/sub connection for {} closed",
                self.channel
            ))),
            Ok(Some(msg)) => {
                // Binary payloads are kept rather than dropped.
                let bytes: Vec<u8> = msg.get_payload()?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
    }

    async fn unsubscribe(&mut self) -> RedisResult<()> {
        self.pubsub.unsubscribe(&self.channel).await?;
        debug!(channel = %self.channel, "Unsubscribed from Redis channel");
        Ok(())
    }
}

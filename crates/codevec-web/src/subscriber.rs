//! Session channel subscription that survives broker outages.
//!
//! A broken link never ends the client connection by itself: the subscriber
//! drops the dead subscription, re-subscribes with capped exponential backoff
//! and resumes delivery. Messages published while no subscription was live
//! are not recovered.

use std::sync::Arc;
use std::time::Duration;

use codevec_core::config::GatewayConfig;
use codevec_core::ChannelMessage;
use codevec_redis::{Broker, RedisError, Subscription};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] RedisError),

    #[error("Gave up reconnecting to {channel} after {attempts} attempts")]
    ReconnectExhausted { channel: String, attempts: u32 },
}

/// Timing for polls and reconnects.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Longest single wait for a message; cancellation is checked at least
    /// this often.
    pub poll_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub jitter: f64,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for SubscriberConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            jitter: config.reconnect_jitter,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Healthy,
    Degraded,
}

pub struct ReconnectingSubscriber {
    broker: Arc<dyn Broker>,
    channel: String,
    config: SubscriberConfig,
    subscription: Option<Box<dyn Subscription>>,
    backoff: Backoff,
    closed: bool,
}

impl ReconnectingSubscriber {
    /// Subscribe to `channel`. The first subscribe is not retried: a broker
    /// that is down at connection start is reported to the caller.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        channel: &str,
        config: SubscriberConfig,
    ) -> Result<Self, SubscriberError> {
        let subscription = broker.subscribe(channel).await?;
        let backoff = Backoff::new(config.reconnect_initial, config.reconnect_max)
            .with_jitter(config.jitter);
        debug!(channel, "Subscriber connected");

        Ok(Self {
            broker,
            channel: channel.to_string(),
            config,
            subscription: Some(subscription),
            backoff,
            closed: false,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn link_state(&self) -> LinkState {
        if self.subscription.is_some() {
            LinkState::Healthy
        } else {
            LinkState::Degraded
        }
    }

    /// Next message on the channel.
    ///
    /// Returns `Ok(None)` once `cancel` fires or after [`close`](Self::close).
    /// Link errors are handled internally; the only error after a successful
    /// connect is running out of the configured reconnect attempts.
    pub async fn next_message(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ChannelMessage>, SubscriberError> {
        loop {
            if self.closed || cancel.is_cancelled() {
                return Ok(None);
            }

            if self.subscription.is_none() {
                if !self.reconnect(cancel).await? {
                    return Ok(None);
                }
                continue;
            }
            let Some(subscription) = self.subscription.as_mut() else {
                continue;
            };

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                polled = subscription.next_message(self.config.poll_interval) => polled,
            };

            match polled {
                Ok(Some(raw)) => return Ok(Some(ChannelMessage::parse(&raw))),
                Ok(None) => continue,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Broker link lost, reconnecting");
                    // The link is gone; there is nothing left to unsubscribe.
                    self.subscription = None;
                }
            }
        }
    }

    /// One reconnect attempt, sleeping the backoff delay on failure.
    /// Returns false when cancelled.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<bool, SubscriberError> {
        let attempt = self.backoff.attempts() + 1;
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            subscribed = self.broker.subscribe(&self.channel) => subscribed,
        };

        match subscribed {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.backoff.reset();
                info!(channel = %self.channel, attempt, "Re-subscribed after broker outage");
                Ok(true)
            }
            Err(e) => {
                if let Some(max) = self.config.max_reconnect_attempts {
                    if attempt >= max {
                        warn!(
                            channel = %self.channel,
                            attempts = attempt,
                            error = %e,
                            "Reconnect attempts exhausted"
                        );
                        return Err(SubscriberError::ReconnectExhausted {
                            channel: self.channel.clone(),
                            attempts: attempt,
                        });
                    }
                }
                let delay = self.backoff.next_delay();
                warn!(
                    channel = %self.channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reconnect failed"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Ok(false),
                    _ = tokio::time::sleep(delay) => Ok(true),
                }
            }
        }
    }

    /// Release the broker-side subscription. Safe to call more than once.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut subscription) = self.subscription.take() {
            if let Err(e) = subscription.unsubscribe().await {
                warn!(channel = %self.channel, error = %e, "Unsubscribe failed");
            }
        }
    }
}

impl Drop for ReconnectingSubscriber {
    fn drop(&mut self) {
        let Some(mut subscription) = self.subscription.take() else {
            return;
        };
        let channel = std::mem::take(&mut self.channel);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = subscription.unsubscribe().await {
                        warn!(channel = %channel, error = %e, "Deferred unsubscribe failed");
                    }
                });
            }
            Err(_) => warn!(channel = %channel, "Subscriber dropped outside a runtime"),
        }
    }
}

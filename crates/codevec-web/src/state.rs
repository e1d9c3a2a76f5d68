//! Application state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use codevec_core::config::GatewayConfig;
use codevec_redis::{Broker, TaskQueue};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenVerifier;
use crate::registry::ChannelRegistry;
use crate::subscriber::SubscriberConfig;

/// Per-connection relay behaviour.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Publish client text frames onto the session channel.
    pub allow_client_publish: bool,
    pub inbound_timeout: Duration,
    /// How long teardown waits for the outbound pump before aborting it.
    pub drain_timeout: Duration,
    pub subscriber: SubscriberConfig,
}

impl From<&GatewayConfig> for RelaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            allow_client_publish: config.allow_client_publish,
            inbound_timeout: config.inbound_timeout(),
            drain_timeout: config.poll_interval() * 2,
            subscriber: SubscriberConfig::from(config),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<ChannelRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub relay: Arc<RelaySettings>,
    /// Cancelled on server shutdown; every connection runs on a child token.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: Arc<dyn TaskQueue>,
        verifier: TokenVerifier,
        relay: RelaySettings,
    ) -> Self {
        Self {
            broker,
            queue,
            registry: Arc::new(ChannelRegistry::new()),
            verifier: Arc::new(verifier),
            relay: Arc::new(relay),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}

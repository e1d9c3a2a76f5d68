//! Runtime configuration.
//!
//! Values resolve in order: built-in defaults, then an optional TOML file,
//! then environment variables. Command-line flags are applied last by the
//! binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CodevecError, CodevecResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub worker: WorkerConfig,
    pub ollama: OllamaConfig,
    pub qdrant: QdrantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Full URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Forward client frames onto the session channel.
    pub allow_client_publish: bool,
    pub poll_interval_ms: u64,
    pub inbound_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter: f64,
    /// Give up on a connection after this many failed reconnects in a row.
    /// Unset means retry forever at the capped interval.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allow_client_publish: true,
            poll_interval_ms: 1_000,
            inbound_timeout_ms: 5_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: None,
        }
    }
}

impl GatewayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inbound_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue: String,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    /// A taken task not settled within this window is presumed lost with its
    /// worker and goes back through the retry policy.
    pub visibility_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue: "tasks".to_string(),
            max_retries: codevec_redis::DEFAULT_MAX_RETRIES,
            poll_interval_ms: 1_000,
            visibility_timeout_secs: 600,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            embedding_model: "all-minilm".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub top_k: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            top_k: 5,
        }
    }
}

impl Config {
    /// Load defaults, the optional file and the process environment.
    pub fn load(path: Option<&Path>) -> CodevecResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let config = Self::from_toml(&text)?;
                debug!(path = %path.display(), "Loaded config file");
                config
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> CodevecResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| CodevecError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot drive the runtime.
    pub fn validate(&self) -> CodevecResult<()> {
        let jitter = self.gateway.reconnect_jitter;
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            return Err(CodevecError::config(format!(
                "gateway.reconnect_jitter must be between 0 and 1, got {}",
                jitter
            )));
        }
        if self.gateway.poll_interval_ms == 0 {
            return Err(CodevecError::config("gateway.poll_interval_ms must be positive"));
        }
        if self.worker.visibility_timeout_secs == 0 {
            return Err(CodevecError::config("worker.visibility_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Override fields from environment variables looked up via `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CodevecResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(host) = var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = var("REDIS_PORT") {
            self.redis.port = parse_number("REDIS_PORT", &port)?;
        }
        if let Some(password) = var("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }

        if let Some(secret) = var("CODEVEC_JWT_SECRET").or_else(|| var("SUPABASE_JWT_SECRET")) {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(flag) = var("CODEVEC_ALLOW_CLIENT_PUBLISH") {
            self.gateway.allow_client_publish = parse_bool("CODEVEC_ALLOW_CLIENT_PUBLISH", &flag)?;
        }

        if let Some(concurrency) = var("CODEVEC_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_number("CODEVEC_WORKER_CONCURRENCY", &concurrency)?;
        }

        if let Some(url) = var("OLLAMA_HOST") {
            self.ollama.url = url;
        }
        if let Some(model) = var("MODEL_NAME") {
            self.ollama.model = model;
        }
        if let Some(model) = var("EMBEDDING_MODEL") {
            self.ollama.embedding_model = model;
        }

        if let Some(url) = var("QDRANT_URL") {
            self.qdrant.url = url;
        }
        if let Some(key) = var("QDRANT_API") {
            self.qdrant.api_key = Some(key);
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> CodevecResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CodevecError::config(format!("{} must be a number, got '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> CodevecResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CodevecError::config(format!("{} must be a boolean, got '{}'", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.redis.url(), "redis://localhost:6379/0");
        assert_eq!(config.gateway.reconnect_initial(), Duration::from_secs(1));
        assert_eq!(config.gateway.reconnect_max(), Duration::from_secs(30));
        assert_eq!(config.gateway.inbound_timeout(), Duration::from_secs(5));
        assert!(config.gateway.max_reconnect_attempts.is_none());
        assert_eq!(config.qdrant.top_k, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [gateway]
            port = 9000
            max_reconnect_attempts = 10

            [worker]
            concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.max_reconnect_attempts, Some(10));
        assert_eq!(config.gateway.poll_interval_ms, 1_000);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.queue, "tasks");
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = Config::from_toml("[gateway]\nport = \"eighty\"").unwrap_err();
        assert!(matches!(err, CodevecError::Config(_)));
    }

    #[test]
    fn test_unusable_jitter_is_rejected() {
        for value in ["nan", "inf", "-0.5", "1.5"] {
            let text = format!("[gateway]\nreconnect_jitter = {}", value);
            let err = Config::from_toml(&text).unwrap_err();
            assert!(matches!(err, CodevecError::Config(ref m) if m.contains("reconnect_jitter")));
        }
        assert!(Config::from_toml("[gateway]\nreconnect_jitter = 0.0").is_ok());
        assert!(Config::from_toml("[gateway]\nreconnect_jitter = 1.0").is_ok());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        assert!(Config::from_toml("[gateway]\npoll_interval_ms = 0").is_err());
        assert!(Config::from_toml("[worker]\nvisibility_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("REDIS_HOST", "redis.internal"),
                ("REDIS_PORT", "6380"),
                ("REDIS_PASSWORD", "hunter2"),
                ("SUPABASE_JWT_SECRET", "legacy"),
                ("CODEVEC_ALLOW_CLIENT_PUBLISH", "false"),
                ("MODEL_NAME", "llama3.2"),
            ]))
            .unwrap();
        assert_eq!(config.redis.url(), "redis://:hunter2@redis.internal:6380/0");
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("legacy"));
        assert!(!config.gateway.allow_client_publish);
        assert_eq!(config.ollama.model, "llama3.2");
    }

    #[test]
    fn test_codevec_secret_wins_over_legacy_name() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("CODEVEC_JWT_SECRET", "new"), ("SUPABASE_JWT_SECRET", "old")]))
            .unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("new"));
    }

    #[test]
    fn test_redis_url_wins_over_parts() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("REDIS_URL", "redis://cache:6379/2"), ("REDIS_HOST", "ignored")]))
            .unwrap();
        assert_eq!(config.redis.url(), "redis://cache:6379/2");
    }

    #[test]
    fn test_bad_env_number_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("REDIS_PORT", "six")])).unwrap_err();
        assert!(matches!(err, CodevecError::Config(_)));
    }
}

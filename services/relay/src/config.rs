use anyhow::{Context, Result, anyhow};
use base64::Engine;
use plume_backlog::BacklogConfig;
use plume_client::{BackoffConfig, ClientConfig, FeedUrl};
use plume_crypto::VerificationMode;
use plume_server::ServerConfig;
use plume_transport::TransportConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Relay service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    // Feed listener bind address.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Upstream feed endpoints, tried in order.
    pub upstream_urls: Vec<FeedUrl>,
    // Per-URL connect attempt budget.
    pub connect_timeout_ms: u64,
    // Budget for the Resume/Hello exchange.
    pub handshake_timeout_ms: u64,
    // Backlog retention limits.
    pub backlog_max_messages: usize,
    pub backlog_max_bytes: usize,
    // Per-subscriber outbound queue depth.
    pub queue_depth: usize,
    // Idle timeout for subscriber and upstream connections.
    pub idle_timeout_ms: u64,
    // Live-delivery coalescing limits.
    pub batch_max_messages: usize,
    pub batch_max_bytes: usize,
    pub batch_max_delay_us: u64,
    // Reconnect backoff.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,
    // Give up after this many consecutive failed attempts (None = never).
    pub max_reconnect_attempts: Option<u32>,
    // Feed signature policy. The verifying key is required unless the
    // upstream feed is unsigned and that has been explicitly accepted.
    pub verification_mode: VerificationMode,
    pub feed_verifying_key: Option<[u8; 32]>,
    // Accept any upstream TLS certificate. Dev/test only.
    pub upstream_insecure_tls: bool,
}

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_BACKLOG_MAX_MESSAGES: usize = 4096;
const DEFAULT_BACKLOG_MAX_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_QUEUE_DEPTH: usize = 256;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BATCH_MAX_MESSAGES: usize = 64;
const DEFAULT_BATCH_MAX_BYTES: usize = 256 * 1024;
const DEFAULT_BATCH_MAX_DELAY_US: u64 = 250;
const DEFAULT_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 15_000;
const DEFAULT_BACKOFF_JITTER: f64 = 0.25;

#[derive(Debug, Deserialize)]
struct RelayConfigOverride {
    listen_bind: Option<String>,
    metrics_bind: Option<String>,
    upstream_urls: Option<Vec<String>>,
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    backlog_max_messages: Option<usize>,
    backlog_max_bytes: Option<usize>,
    queue_depth: Option<usize>,
    idle_timeout_ms: Option<u64>,
    batch_max_messages: Option<usize>,
    batch_max_bytes: Option<usize>,
    batch_max_delay_us: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    max_reconnect_attempts: Option<u32>,
    verification_mode: Option<String>,
    feed_verifying_key: Option<String>,
    upstream_insecure_tls: Option<bool>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

fn parse_mode(value: &str) -> Result<VerificationMode> {
    match value {
        "enforced" => Ok(VerificationMode::Enforced),
        // Spelled out on purpose; this mode delivers unverified messages.
        "accept-missing" => Ok(VerificationMode::AcceptMissing),
        other => Err(anyhow!("unknown verification mode: {other}")),
    }
}

fn parse_verifying_key(value: &str) -> Result<[u8; 32]> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .context("decode PLUME_FEED_VERIFYING_KEY")?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("feed verifying key must be 32 bytes"))
}

fn parse_urls(value: &str) -> Result<Vec<FeedUrl>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().with_context(|| format!("parse feed url {part}")))
        .collect()
}

impl RelayServiceConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen_bind = std::env::var("PLUME_LISTEN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9550".to_string())
            .parse()
            .with_context(|| "parse PLUME_LISTEN_BIND")?;
        let metrics_bind = std::env::var("PLUME_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse PLUME_METRICS_BIND")?;
        let upstream_urls = match std::env::var("PLUME_UPSTREAM_URLS") {
            Ok(value) => parse_urls(&value)?,
            Err(_) => Vec::new(),
        };
        let verification_mode = match std::env::var("PLUME_VERIFY_MODE") {
            Ok(value) => parse_mode(&value)?,
            Err(_) => VerificationMode::Enforced,
        };
        let feed_verifying_key = match std::env::var("PLUME_FEED_VERIFYING_KEY") {
            Ok(value) => Some(parse_verifying_key(&value)?),
            Err(_) => None,
        };
        Ok(Self {
            listen_bind,
            metrics_bind,
            upstream_urls,
            connect_timeout_ms: env_parse("PLUME_CONNECT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout_ms: env_parse("PLUME_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            backlog_max_messages: env_parse("PLUME_BACKLOG_MAX_MESSAGES")
                .unwrap_or(DEFAULT_BACKLOG_MAX_MESSAGES),
            backlog_max_bytes: env_parse("PLUME_BACKLOG_MAX_BYTES")
                .unwrap_or(DEFAULT_BACKLOG_MAX_BYTES),
            queue_depth: env_parse("PLUME_QUEUE_DEPTH").unwrap_or(DEFAULT_QUEUE_DEPTH),
            idle_timeout_ms: env_parse("PLUME_IDLE_TIMEOUT_MS").unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            batch_max_messages: env_parse("PLUME_BATCH_MAX_MESSAGES")
                .unwrap_or(DEFAULT_BATCH_MAX_MESSAGES),
            batch_max_bytes: env_parse("PLUME_BATCH_MAX_BYTES").unwrap_or(DEFAULT_BATCH_MAX_BYTES),
            batch_max_delay_us: env_parse("PLUME_BATCH_MAX_DELAY_US")
                .unwrap_or(DEFAULT_BATCH_MAX_DELAY_US),
            backoff_base_ms: env_parse("PLUME_BACKOFF_BASE_MS").unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: env_parse("PLUME_BACKOFF_MAX_MS").unwrap_or(DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: env_parse("PLUME_BACKOFF_JITTER").unwrap_or(DEFAULT_BACKOFF_JITTER),
            max_reconnect_attempts: env_parse("PLUME_MAX_RECONNECT_ATTEMPTS"),
            verification_mode,
            feed_verifying_key,
            upstream_insecure_tls: env_flag("PLUME_UPSTREAM_INSECURE_TLS").unwrap_or(false),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PLUME_RELAY_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read PLUME_RELAY_CONFIG: {path}"))?;
            let override_cfg: RelayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse relay config yaml")?;
            if let Some(value) = override_cfg.listen_bind {
                config.listen_bind = value.parse().with_context(|| "parse listen_bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(values) = override_cfg.upstream_urls {
                config.upstream_urls = parse_urls(&values.join(","))?;
            }
            if let Some(value) = override_cfg.connect_timeout_ms {
                config.connect_timeout_ms = value;
            }
            if let Some(value) = override_cfg.handshake_timeout_ms {
                config.handshake_timeout_ms = value;
            }
            if let Some(value) = override_cfg.backlog_max_messages {
                config.backlog_max_messages = value;
            }
            if let Some(value) = override_cfg.backlog_max_bytes {
                config.backlog_max_bytes = value;
            }
            if let Some(value) = override_cfg.queue_depth {
                config.queue_depth = value;
            }
            if let Some(value) = override_cfg.idle_timeout_ms {
                config.idle_timeout_ms = value;
            }
            if let Some(value) = override_cfg.batch_max_messages {
                config.batch_max_messages = value;
            }
            if let Some(value) = override_cfg.batch_max_bytes {
                config.batch_max_bytes = value;
            }
            if let Some(value) = override_cfg.batch_max_delay_us {
                config.batch_max_delay_us = value;
            }
            if let Some(value) = override_cfg.backoff_base_ms {
                config.backoff_base_ms = value;
            }
            if let Some(value) = override_cfg.backoff_max_ms {
                config.backoff_max_ms = value;
            }
            if let Some(value) = override_cfg.backoff_jitter {
                config.backoff_jitter = value;
            }
            if let Some(value) = override_cfg.max_reconnect_attempts {
                config.max_reconnect_attempts = Some(value);
            }
            if let Some(value) = override_cfg.verification_mode {
                config.verification_mode = parse_mode(&value)?;
            }
            if let Some(value) = override_cfg.feed_verifying_key {
                config.feed_verifying_key = Some(parse_verifying_key(&value)?);
            }
            if let Some(value) = override_cfg.upstream_insecure_tls {
                config.upstream_insecure_tls = value;
            }
        }
        Ok(config)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ..TransportConfig::default()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new(self.upstream_urls.clone());
        client.transport = self.transport_config();
        client.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        client.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        client.backoff = BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            jitter: self.backoff_jitter,
        };
        client.max_reconnect_attempts = self.max_reconnect_attempts;
        client
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            queue_depth: self.queue_depth,
            batch_max_messages: self.batch_max_messages,
            batch_max_bytes: self.batch_max_bytes,
            batch_max_delay: Duration::from_micros(self.batch_max_delay_us),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ..ServerConfig::default()
        }
    }

    pub fn backlog_config(&self) -> BacklogConfig {
        BacklogConfig {
            max_messages: self.backlog_max_messages,
            max_bytes: self.backlog_max_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _g1 = EnvGuard::unset("PLUME_LISTEN_BIND");
        let _g2 = EnvGuard::unset("PLUME_UPSTREAM_URLS");
        let _g3 = EnvGuard::unset("PLUME_VERIFY_MODE");
        let _g4 = EnvGuard::unset("PLUME_RELAY_CONFIG");
        let config = RelayServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert!(config.upstream_urls.is_empty());
        assert_eq!(config.verification_mode, VerificationMode::Enforced);
        assert!(!config.upstream_insecure_tls);
    }

    #[test]
    #[serial]
    fn parses_upstream_urls_and_mode() {
        let _g1 = EnvGuard::set("PLUME_UPSTREAM_URLS", "127.0.0.1:9550, 127.0.0.1:9551");
        let _g2 = EnvGuard::set("PLUME_VERIFY_MODE", "accept-missing");
        let _g3 = EnvGuard::unset("PLUME_RELAY_CONFIG");
        let config = RelayServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.upstream_urls.len(), 2);
        assert_eq!(config.verification_mode, VerificationMode::AcceptMissing);
    }

    #[test]
    #[serial]
    fn rejects_unknown_mode() {
        let _g1 = EnvGuard::set("PLUME_VERIFY_MODE", "trust-me");
        let err = RelayServiceConfig::from_env().expect_err("mode");
        assert!(err.to_string().contains("unknown verification mode"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _g1 = EnvGuard::unset("PLUME_UPSTREAM_URLS");
        let dir = std::env::temp_dir().join("plume-relay-config-test");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("relay.yaml");
        std::fs::write(
            &path,
            "queue_depth: 32\nupstream_urls:\n  - \"127.0.0.1:9555\"\n",
        )
        .expect("write");
        let _g2 = EnvGuard::set("PLUME_RELAY_CONFIG", path.to_str().unwrap());
        let config = RelayServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.queue_depth, 32);
        assert_eq!(config.upstream_urls.len(), 1);
    }

    #[test]
    #[serial]
    fn client_config_carries_backoff() {
        let _g1 = EnvGuard::set("PLUME_BACKOFF_BASE_MS", "250");
        let _g2 = EnvGuard::set("PLUME_UPSTREAM_URLS", "127.0.0.1:9550");
        let _g3 = EnvGuard::unset("PLUME_RELAY_CONFIG");
        let config = RelayServiceConfig::from_env_or_yaml().expect("config");
        let client = config.client_config();
        assert_eq!(client.backoff.base, Duration::from_millis(250));
        assert_eq!(client.urls.len(), 1);
    }
}

// Client configuration surface.
use plume_transport::TransportConfig;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// One upstream endpoint: socket address plus the TLS server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUrl {
    pub addr: SocketAddr,
    pub server_name: String,
}

impl FeedUrl {
    pub fn new(addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            addr,
            server_name: server_name.into(),
        }
    }
}

impl FromStr for FeedUrl {
    type Err = InvalidFeedUrl;

    // Accepts "host:port"; the host doubles as the TLS server name.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (host, _port) = input
            .rsplit_once(':')
            .ok_or_else(|| InvalidFeedUrl(input.to_string()))?;
        let addr = input
            .to_socket_addrs()
            .map_err(|_| InvalidFeedUrl(input.to_string()))?
            .next()
            .ok_or_else(|| InvalidFeedUrl(input.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(addr, host))
    }
}

impl std::fmt::Display for FeedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid feed url: {0}")]
pub struct InvalidFeedUrl(String);

/// Broadcast client configuration.
///
/// URLs are tried in order with the same backoff policy; at most one is
/// consumed at a time (active/standby).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub urls: Vec<FeedUrl>,
    // Resume point for the first connection, before anything has been
    // delivered. None subscribes "from now". After the first delivery the
    // client always resumes from its own last delivered sequence.
    pub resume_from: Option<u64>,
    // Per-URL connect attempt budget.
    pub connect_timeout: Duration,
    // Budget for the Resume/Hello exchange.
    pub handshake_timeout: Duration,
    // Depth of the ordered delivery queue toward the consumer. When the
    // consumer lags the client blocks here: the feed never drops or
    // reorders on this side, it pushes backpressure up to the socket.
    pub queue_capacity: usize,
    pub backoff: BackoffConfig,
    // Total consecutive failed attempts (across all URLs) before the
    // client gives up and reports RetriesExhausted. None retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn new(urls: Vec<FeedUrl>) -> Self {
        Self {
            urls,
            resume_from: None,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: None,
            transport: TransportConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let url: FeedUrl = "127.0.0.1:9550".parse().expect("url");
        assert_eq!(url.addr, "127.0.0.1:9550".parse::<SocketAddr>().unwrap());
        assert_eq!(url.server_name, "127.0.0.1");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("localhost".parse::<FeedUrl>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::new(Vec::new());
        assert!(config.queue_capacity > 0);
        assert!(config.max_reconnect_attempts.is_none());
    }
}

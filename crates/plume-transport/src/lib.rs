// QUIC transport configuration and primitives for feed endpoints.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Transport-level tuning for feed connections.
///
/// A feed connection carries exactly one long-lived bidirectional stream,
/// so stream limits are kept small; keep-alive and idle timeout do the
/// dead-peer detection that the feed protocol itself does not.
///
/// ```
/// use plume_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            keep_alive: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        config.keep_alive_interval(Some(self.keep_alive));
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout)
            .map_err(|_| anyhow!("idle timeout out of range"))?;
        config.max_idle_timeout(Some(idle));
        // One control/feed stream per connection, with a little slack.
        config.max_concurrent_bidi_streams(VarInt::from_u32(4));
        config.max_concurrent_uni_streams(VarInt::from_u32(0));
        Ok(config)
    }
}

/// Stable connection identifier used for tracing/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Metadata about a live feed connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// Listening endpoint a broadcast server accepts subscribers on.
///
/// ```no_run
/// use plume_transport::{FeedListener, TransportConfig};
/// use quinn::ServerConfig;
/// use std::net::SocketAddr;
///
/// fn server_config() -> ServerConfig {
///     // Provide a real TLS config when wiring this up in a service.
///     unimplemented!()
/// }
///
/// let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");
/// let transport = TransportConfig::default();
/// let _listener = FeedListener::bind(bind, server_config(), transport).expect("bind");
/// ```
#[derive(Debug)]
pub struct FeedListener {
    endpoint: Endpoint,
}

impl FeedListener {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind feed listener")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<FeedConn> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("feed listener closed"))?;
        let connection = connecting.await.context("accept feed connection")?;
        Ok(FeedConn::new(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("read feed listener address")
    }

    // Stop accepting and tear down every connection on this endpoint.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

/// Dialing endpoint a broadcast client connects upstream with.
#[derive(Debug)]
pub struct FeedDialer {
    endpoint: Endpoint,
}

impl FeedDialer {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind feed dialer")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    /// Connect with a per-attempt timeout; a hung dial counts as failed.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        timeout: Duration,
    ) -> Result<FeedConn> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate feed connection")?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| anyhow!("connect to {addr} timed out after {timeout:?}"))?
            .context("establish feed connection")?;
        Ok(FeedConn::new(connection))
    }
}

/// Active feed connection.
#[derive(Debug, Clone)]
pub struct FeedConn {
    inner: Connection,
    info: ConnectionInfo,
}

impl FeedConn {
    fn new(connection: Connection) -> Self {
        let info = ConnectionInfo {
            id: ConnectionId(u64::try_from(connection.stable_id()).expect("stable id fits u64")),
            peer_addr: connection.remote_address(),
        };
        Self {
            inner: connection,
            info,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Open the feed stream to the peer (client side).
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open feed stream")
    }

    /// Accept the peer's feed stream (server side).
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept feed stream")
    }

    /// Close immediately with an application error code.
    ///
    /// Used for graceful shutdown and for forced slow-consumer eviction;
    /// pending stream data is discarded, which is exactly what eviction
    /// wants.
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.inner.close(VarInt::from_u32(code), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use rcgen::generate_simple_self_signed;
    use rustls::RootCertStore;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
    use std::sync::Arc;

    #[test]
    fn default_transport_config() {
        // Basic sanity checks on defaults.
        let config = TransportConfig::default();
        assert!(config.max_frame_bytes > 0);
        assert!(config.keep_alive < config.idle_timeout);
        config.quinn_transport_config().expect("quinn config");
    }

    fn make_server_config() -> Result<(ServerConfig, CertificateDer<'static>)> {
        let cert = generate_simple_self_signed(vec!["localhost".into()])
            .context("generate self-signed cert")?;
        let cert_der = CertificateDer::from(cert.serialize_der()?);
        let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
        let server_config = ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())
            .context("build server config")?;
        Ok((server_config, cert_der))
    }

    fn make_client_config(cert: CertificateDer<'static>) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(cert).context("add root cert")?;
        Ok(ClientConfig::with_root_certificates(Arc::new(roots))?)
    }

    #[tokio::test]
    async fn feed_stream_smoke() -> Result<()> {
        let (server_config, cert) = make_server_config()?;
        let transport = TransportConfig::default();
        let listener = FeedListener::bind("127.0.0.1:0".parse()?, server_config, transport.clone())?;
        let addr = listener.local_addr()?;

        let server_task = tokio::spawn(async move {
            let connection = listener.accept().await?;
            let (mut send, mut recv) = connection.accept_bi().await?;
            let buf = recv.read_to_end(1024).await?;
            send.write_all(&buf).await?;
            send.finish()?;
            send.stopped().await?;
            Result::<()>::Ok(())
        });

        let dialer = FeedDialer::bind("0.0.0.0:0".parse()?, make_client_config(cert)?, transport)?;
        let connection = dialer
            .connect(addr, "localhost", Duration::from_secs(2))
            .await?;
        assert_eq!(connection.info().peer_addr, addr);
        let (mut send, mut recv) = connection.open_bi().await?;
        send.write_all(b"ping").await?;
        send.finish()?;
        let response = recv.read_to_end(1024).await?;
        assert_eq!(response, b"ping");

        server_task.await.context("server task join")??;
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_unanswering_peer_fails_within_timeout() -> Result<()> {
        let (_server_config, cert) = make_server_config()?;
        let transport = TransportConfig::default();
        let dialer = FeedDialer::bind("0.0.0.0:0".parse()?, make_client_config(cert)?, transport)?;
        // TEST-NET-1 address; nothing answers, so the dial either times
        // out or fails fast depending on the host's routing.
        let started = std::time::Instant::now();
        let result = dialer
            .connect(
                "192.0.2.1:4040".parse()?,
                "localhost",
                Duration::from_millis(200),
            )
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
}

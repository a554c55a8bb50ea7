// In-process feed fixtures: a server on an ephemeral port plus matching
// client configs.
use anyhow::{Context, Result};
use plume_backlog::BacklogConfig;
use plume_client::{BroadcastClient, ClientConfig, ClientHandle, FeedEvent, FeedUrl};
use plume_crypto::FeedVerifier;
use plume_server::{BroadcastServer, ServerConfig};
use plume_transport::{FeedListener, TransportConfig};
use plume_wire::FeedMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::tls;

/// Install the process-wide rustls crypto provider. Safe to call from
/// every test; the first caller wins.
pub fn init_crypto() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
}

/// A broadcast server listening on an ephemeral local port.
pub struct TestFeed {
    pub server: Arc<BroadcastServer>,
    pub addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl TestFeed {
    pub async fn start(server_config: ServerConfig, backlog: BacklogConfig) -> Result<Self> {
        Self::start_on("127.0.0.1:0".parse().expect("addr"), server_config, backlog).await
    }

    /// Start on a specific address; used by restart scenarios that need
    /// the replacement server on the same port.
    pub async fn start_on(
        bind: SocketAddr,
        server_config: ServerConfig,
        backlog: BacklogConfig,
    ) -> Result<Self> {
        init_crypto();
        let listener = FeedListener::bind(
            bind,
            tls::build_server_config()?,
            TransportConfig::default(),
        )
        .context("bind test feed listener")?;
        let addr = listener.local_addr()?;
        let server = Arc::new(BroadcastServer::new(server_config, backlog));
        let accept = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(err) = server.serve(listener).await {
                    tracing::debug!(error = %err, "test feed accept loop exited");
                }
            })
        };
        Ok(Self {
            server,
            addr,
            accept,
        })
    }

    /// Stop accepting and drop every subscriber connection.
    pub async fn shutdown(self) {
        self.server.shutdown();
        let _ = self.accept.await;
    }
}

/// Client config pointed at a list of local feeds.
pub fn client_config(addrs: &[SocketAddr]) -> ClientConfig {
    let urls = addrs
        .iter()
        .map(|addr| FeedUrl::new(*addr, "localhost"))
        .collect();
    ClientConfig::new(urls)
}

/// Start a broadcast client against local feeds with the insecure test
/// TLS config.
pub fn connect(
    config: ClientConfig,
    verifier: Option<FeedVerifier>,
) -> Result<(
    ClientHandle,
    mpsc::Receiver<FeedMessage>,
    mpsc::Receiver<FeedEvent>,
)> {
    init_crypto();
    BroadcastClient::start(config, tls::build_insecure_client_config()?, verifier)
}

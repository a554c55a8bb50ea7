// Relay service main entry point.
use anyhow::{Context, Result, bail};
use plume_crypto::FeedVerifier;
use plume_relay::{Relay, RelayConfig};
use plume_transport::FeedListener;
use relay::{config, observability, tls};
use std::future::Future;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Install default crypto provider for rustls.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    let metrics_handle = observability::init_observability();

    let config = config::RelayServiceConfig::from_env_or_yaml()?;
    if config.upstream_urls.is_empty() {
        bail!("PLUME_UPSTREAM_URLS must list at least one feed url");
    }
    // Expose Prometheus metrics on the configured bind address.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener_tls = tls::build_server_config().context("build listener TLS config")?;
    let listener = FeedListener::bind(config.listen_bind, listener_tls, config.transport_config())
        .context("bind feed listener")?;
    tracing::info!(addr = %listener.local_addr()?, "feed listener started");

    let verifier = match config.feed_verifying_key {
        Some(key) => Some(
            FeedVerifier::from_bytes(&key, config.verification_mode)
                .context("build feed verifier")?,
        ),
        None => {
            tracing::warn!("no feed verifying key configured, relaying without signature checks");
            None
        }
    };
    let upstream_tls = tls::build_upstream_config(config.upstream_insecure_tls)?;

    let relay_config = RelayConfig {
        upstream: config.client_config(),
        server: config.server_config(),
        backlog: config.backlog_config(),
    };
    let (error_tx, mut error_rx) = mpsc::channel(16);
    let mut relay = Relay::new(relay_config, error_tx);
    relay.start(listener, upstream_tls, verifier)?;
    tracing::info!("relay started");

    tokio::pin!(shutdown);
    let result = tokio::select! {
        _ = &mut shutdown => Ok(()),
        fault = error_rx.recv() => match fault {
            // Every fault on this channel is terminal for a standalone
            // relay: failing over is the operator's call, ours is to exit
            // loudly.
            Some(fault) => {
                tracing::error!(error = %fault, "fatal feed fault");
                Err(anyhow::Error::new(fault))
            }
            None => Ok(()),
        },
    };
    relay.stop().await;
    tracing::info!("relay stopped");
    result
}

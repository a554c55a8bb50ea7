// Test harness producer: serves a feed and broadcasts sequenced messages.
use anyhow::{Context, Result};
use base64::Engine as _;
use bytes::Bytes;
use clap::Parser;
use plume_backlog::BacklogConfig;
use plume_crypto::FeedSigner;
use plume_server::{BroadcastServer, ServerConfig};
use plume_transport::{FeedListener, TransportConfig};
use plume_wire::FeedMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "producer")]
#[command(about = "Test harness producer for the plume feed")]
struct Args {
    /// Feed listen address
    #[arg(long, default_value = "127.0.0.1:9550")]
    listen: String,

    /// Milliseconds between messages
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// Number of messages to broadcast (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Payload size in bytes
    #[arg(long, default_value = "256")]
    payload_bytes: usize,

    /// Sign messages with a freshly generated key
    #[arg(long, default_value = "false")]
    sign: bool,

    /// Backlog retention in messages
    #[arg(long, default_value = "4096")]
    backlog: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let signer = if args.sign {
        let signer = FeedSigner::generate();
        let key = base64::engine::general_purpose::STANDARD.encode(signer.verifying_key_bytes());
        info!(verifying_key = %key, "feed signing enabled");
        Some(signer)
    } else {
        None
    };

    let listener = FeedListener::bind(
        args.listen.parse().context("parse listen address")?,
        plume_test_harness::tls::build_server_config()?,
        TransportConfig::default(),
    )?;
    info!(addr = %listener.local_addr()?, "feed listener started");

    let server = Arc::new(BroadcastServer::new(
        ServerConfig::default(),
        BacklogConfig {
            max_messages: args.backlog,
            ..BacklogConfig::default()
        },
    ));
    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let payload = Bytes::from(vec![0x5au8; args.payload_bytes]);
    let mut sequence = 1u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut message = FeedMessage::new(sequence, payload.clone(), None);
                if let Some(signer) = &signer {
                    signer.sign_message(&mut message);
                }
                let reached = server.broadcast(message).context("broadcast")?;
                if sequence % 100 == 0 {
                    info!(sequence, reached, "broadcast progress");
                }
                sequence += 1;
                if args.count != 0 && sequence > args.count {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(broadcast = sequence - 1, "producer stopping");
    server.shutdown();
    accept.abort();
    Ok(())
}

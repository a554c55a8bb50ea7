// Test harness consumer: subscribes to a feed and checks ordering.
use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use clap::Parser;
use plume_client::{BroadcastClient, ClientConfig, FeedEvent, FeedUrl};
use plume_crypto::{FeedVerifier, VerificationMode};
use plume_test_harness::tls;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "consumer")]
#[command(about = "Test harness consumer for the plume feed")]
struct Args {
    /// Feed address (host:port); may repeat for failover
    #[arg(long, default_value = "127.0.0.1:9550")]
    url: Vec<String>,

    /// Resume from this sequence number instead of "from now"
    #[arg(long)]
    resume: Option<u64>,

    /// Base64 verifying key of the expected feed signer
    #[arg(long)]
    verify_key: Option<String>,

    /// Tolerate missing/failing signatures (dangerous, test only)
    #[arg(long, default_value = "false")]
    accept_missing: bool,

    /// Stop after this many messages (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,
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
    let urls = args
        .url
        .iter()
        .map(|url| url.parse::<FeedUrl>().context("parse feed url"))
        .collect::<Result<Vec<_>>>()?;
    let verifier = match &args.verify_key {
        Some(key) => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key.as_bytes())
                .context("decode verify key")?;
            let key: [u8; 32] = decoded
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("verify key must be 32 bytes"))?;
            let mode = if args.accept_missing {
                VerificationMode::AcceptMissing
            } else {
                VerificationMode::Enforced
            };
            Some(FeedVerifier::from_bytes(&key, mode)?)
        }
        None => None,
    };

    let config = ClientConfig::new(urls);
    let (handle, mut messages, mut events) =
        BroadcastClient::start(config, tls::build_insecure_client_config()?, verifier)?;
    info!(resume = ?args.resume, "consumer started");

    let mut received = 0u64;
    let mut last_sequence: Option<u64> = None;
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    if let Some(last) = last_sequence {
                        // The client guarantees this; fail loudly if it lies.
                        if message.sequence_number != last + 1 {
                            error!(
                                expected = last + 1,
                                got = message.sequence_number,
                                "ordering violated"
                            );
                            break;
                        }
                    }
                    last_sequence = Some(message.sequence_number);
                    received += 1;
                    if received % 100 == 0 {
                        info!(
                            sequence = message.sequence_number,
                            received,
                            payload_bytes = message.payload.len(),
                            "consume progress"
                        );
                    }
                    if args.count != 0 && received >= args.count {
                        break;
                    }
                }
                None => {
                    warn!("delivery stream closed");
                    break;
                }
            },
            event = events.recv() => {
                if let Some(event) = event {
                    match event {
                        FeedEvent::ResyncRequired { oldest, requested } => {
                            error!(oldest, requested, "resync required, stopping");
                            break;
                        }
                        other => info!(?other, "feed event"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(received, ?last_sequence, "consumer stopping");
    handle.stop().await;
    Ok(())
}

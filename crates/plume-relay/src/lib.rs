// Relay: a broadcast client wired to a broadcast server, for tree-shaped
// feed fan-out. Adds no messages, reorders nothing; every delivered
// message is re-broadcast verbatim into the relay's own backlog.
use plume_backlog::{BacklogConfig, BacklogError};
use plume_client::{BroadcastClient, ClientConfig, ClientHandle, FeedEvent};
use plume_crypto::FeedVerifier;
use plume_server::{BroadcastServer, ServerConfig};
use plume_transport::FeedListener;
use plume_wire::FeedMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: ClientConfig,
    pub server: ServerConfig,
    pub backlog: BacklogConfig,
}

/// Faults reported to the hosting process on the error channel.
///
/// The relay never crashes itself over upstream trouble; the host decides
/// whether to fail over or terminate.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("upstream resume point below retention (oldest {oldest}, requested {requested})")]
    ResyncRequired { oldest: u64, requested: u64 },
    #[error("upstream unreachable after {attempts} attempts across all urls")]
    UpstreamExhausted { attempts: u32 },
    #[error("upstream feed broke sequencing: {0}")]
    Sequencing(#[from] BacklogError),
}

/// A running relay node.
///
/// Construct with the host's error channel, then `start` with a bound
/// listener and the TLS config for dialing upstream.
pub struct Relay {
    config: RelayConfig,
    errors: mpsc::Sender<RelayError>,
    server: Arc<BroadcastServer>,
    client: Option<ClientHandle>,
    forward: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn new(config: RelayConfig, errors: mpsc::Sender<RelayError>) -> Self {
        let server = Arc::new(BroadcastServer::new(
            config.server.clone(),
            config.backlog,
        ));
        Self {
            config,
            errors,
            server,
            client: None,
            forward: None,
            accept: None,
        }
    }

    pub fn server(&self) -> &Arc<BroadcastServer> {
        &self.server
    }

    /// Start serving downstream and consuming upstream.
    pub fn start(
        &mut self,
        listener: FeedListener,
        upstream_tls: quinn::ClientConfig,
        verifier: Option<FeedVerifier>,
    ) -> anyhow::Result<()> {
        let (client, messages, events) =
            BroadcastClient::start(self.config.upstream.clone(), upstream_tls, verifier)?;
        self.client = Some(client);

        let server = Arc::clone(&self.server);
        self.accept = Some(tokio::spawn(async move {
            if let Err(err) = server.serve(listener).await {
                tracing::warn!(error = %err, "relay accept loop exited");
            }
        }));

        let server = Arc::clone(&self.server);
        let errors = self.errors.clone();
        self.forward = Some(tokio::spawn(run_forward(server, messages, events, errors)));
        Ok(())
    }

    /// Stop the upstream client, the forwarder, and the downstream server.
    pub async fn stop(mut self) {
        if let Some(client) = self.client.take() {
            client.stop().await;
        }
        if let Some(forward) = self.forward.take() {
            let _ = forward.await;
        }
        self.server.shutdown();
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
    }
}

async fn run_forward(
    server: Arc<BroadcastServer>,
    mut messages: mpsc::Receiver<FeedMessage>,
    mut events: mpsc::Receiver<FeedEvent>,
    errors: mpsc::Sender<RelayError>,
) {
    let mut events_done = false;
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    // Verbatim: same sequence, payload, block hash, and
                    // signature the upstream delivered.
                    if let Err(err) = server.broadcast(message) {
                        let _ = errors.send(RelayError::Sequencing(err)).await;
                        break;
                    }
                }
                // Upstream client stopped; nothing more to forward.
                None => break,
            },
            event = events.recv(), if !events_done => match event {
                Some(FeedEvent::ConfirmedSequence(seq)) => server.confirm(seq),
                Some(FeedEvent::ResyncRequired { oldest, requested }) => {
                    let _ = errors
                        .send(RelayError::ResyncRequired { oldest, requested })
                        .await;
                }
                Some(FeedEvent::RetriesExhausted { attempts }) => {
                    let _ = errors.send(RelayError::UpstreamExhausted { attempts }).await;
                }
                Some(FeedEvent::Unverified { sequence }) => {
                    tracing::warn!(sequence, "relaying message that failed verification");
                }
                None => events_done = true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn message(seq: u64) -> FeedMessage {
        FeedMessage::new(seq, Bytes::from_static(b"payload"), None)
    }

    fn forward_fixture() -> (
        Arc<BroadcastServer>,
        mpsc::Sender<FeedMessage>,
        mpsc::Sender<FeedEvent>,
        mpsc::Receiver<RelayError>,
        JoinHandle<()>,
    ) {
        let server = Arc::new(BroadcastServer::new(
            ServerConfig::default(),
            BacklogConfig::default(),
        ));
        let (message_tx, message_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (error_tx, error_rx) = mpsc::channel(16);
        let forward = tokio::spawn(run_forward(
            Arc::clone(&server),
            message_rx,
            event_rx,
            error_tx,
        ));
        (server, message_tx, event_tx, error_rx, forward)
    }

    #[tokio::test]
    async fn forwards_messages_into_own_backlog() {
        let (server, message_tx, _event_tx, _error_rx, forward) = forward_fixture();
        message_tx.send(message(1)).await.expect("send");
        message_tx.send(message(2)).await.expect("send");
        drop(message_tx);
        forward.await.expect("forward");
        assert_eq!(server.head(), Some(2));
    }

    #[tokio::test]
    async fn confirmation_events_prune_the_relay_backlog() {
        let (server, message_tx, event_tx, _error_rx, forward) = forward_fixture();
        for seq in 1..=3 {
            message_tx.send(message(seq)).await.expect("send");
        }
        event_tx
            .send(FeedEvent::ConfirmedSequence(2))
            .await
            .expect("send");
        // Let the forwarder drain before closing the channels.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(message_tx);
        drop(event_tx);
        forward.await.expect("forward");
        assert_eq!(server.head(), Some(3));
        assert!(matches!(
            server.broadcast(message(4)),
            Ok(_)
        ));
    }

    #[tokio::test]
    async fn upstream_sequencing_fault_hits_the_error_channel() {
        let (server, message_tx, _event_tx, mut error_rx, forward) = forward_fixture();
        message_tx.send(message(1)).await.expect("send");
        message_tx.send(message(5)).await.expect("send");
        let fault = error_rx.recv().await.expect("fault");
        assert!(matches!(
            fault,
            RelayError::Sequencing(BacklogError::NonContiguous { expected: 2, got: 5 })
        ));
        forward.await.expect("forward");
        assert_eq!(server.head(), Some(1));
    }

    #[tokio::test]
    async fn resync_events_propagate_to_host() {
        let (_server, _message_tx, event_tx, mut error_rx, _forward) = forward_fixture();
        event_tx
            .send(FeedEvent::ResyncRequired {
                oldest: 10,
                requested: 2,
            })
            .await
            .expect("send");
        let fault = error_rx.recv().await.expect("fault");
        assert!(matches!(
            fault,
            RelayError::ResyncRequired {
                oldest: 10,
                requested: 2
            }
        ));
    }
}

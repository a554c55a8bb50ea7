// Connection state machine and ordered delivery pipeline.
use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use plume_crypto::{FeedVerifier, Verification};
use plume_transport::FeedDialer;
use plume_wire::{Envelope, FeedMessage, Message, PROTOCOL_VERSION};
use tokio::sync::{mpsc, watch};

use crate::config::{ClientConfig, FeedUrl};
use crate::wire;

/// Where the client currently is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    CatchingUp,
    Live,
}

/// Out-of-band signals surfaced alongside the delivery stream.
///
/// `ResyncRequired` and `RetriesExhausted` are terminal: the client stops
/// after emitting them and the host must decide what to do. The rest are
/// advisory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    // The requested resume point predates the server's retention window;
    // recovery needs an out-of-band resync, not a reconnect.
    ResyncRequired { oldest: u64, requested: u64 },
    // Every configured URL failed within the configured attempt budget.
    RetriesExhausted { attempts: u32 },
    // The producer announced parent-chain settlement through this sequence.
    ConfirmedSequence(u64),
    // AcceptMissing mode delivered a message it could not verify.
    Unverified { sequence: u64 },
}

pub struct BroadcastClient;

impl BroadcastClient {
    /// Start the subscriber task.
    ///
    /// Returns the control handle, the ordered message stream, and the
    /// event stream. Messages arrive strictly in increasing sequence
    /// order with no gaps; when the consumer lags, delivery blocks rather
    /// than drops.
    pub fn start(
        config: ClientConfig,
        tls: quinn::ClientConfig,
        verifier: Option<FeedVerifier>,
    ) -> Result<(
        ClientHandle,
        mpsc::Receiver<FeedMessage>,
        mpsc::Receiver<FeedEvent>,
    )> {
        if config.urls.is_empty() {
            bail!("no feed urls configured");
        }
        let dialer = FeedDialer::bind(
            "0.0.0.0:0".parse().expect("bind addr"),
            tls,
            config.transport.clone(),
        )?;
        let (delivery_tx, delivery_rx) = mpsc::channel(config.queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let task = ClientTask {
            config,
            dialer,
            verifier,
            delivery: delivery_tx,
            events: event_tx,
            status: status_tx,
            shutdown: shutdown_rx,
            last_delivered: None,
            failures: 0,
        };
        let join = tokio::spawn(task.run());
        Ok((
            ClientHandle {
                shutdown: shutdown_tx,
                status: status_rx,
                task: join,
            },
            delivery_rx,
            event_rx,
        ))
    }
}

/// Control handle for a running client.
pub struct ClientHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ConnectionStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl ClientHandle {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Cancel the connection task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

enum SessionEnd {
    Shutdown,
    ConsumerGone,
    ResyncRequired { oldest: u64, requested: u64 },
}

struct ClientTask {
    config: ClientConfig,
    dialer: FeedDialer,
    verifier: Option<FeedVerifier>,
    delivery: mpsc::Sender<FeedMessage>,
    events: mpsc::Sender<FeedEvent>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
    last_delivered: Option<u64>,
    // Consecutive failed attempts since the last successful handshake.
    failures: u32,
}

impl ClientTask {
    async fn run(mut self) {
        let mut url_index = 0usize;
        // A second receiver so shutdown can also interrupt the dial
        // itself, not just the read loop.
        let mut shutdown = self.shutdown.clone();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let url = self.config.urls[url_index % self.config.urls.len()].clone();
            let _ = self.status.send(ConnectionStatus::Connecting);
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.run_connection(&url) => outcome,
            };
            match outcome {
                Ok(SessionEnd::Shutdown) | Ok(SessionEnd::ConsumerGone) => break,
                Ok(SessionEnd::ResyncRequired { oldest, requested }) => {
                    // Loud and specific: this is not a connection error and
                    // a reconnect cannot fix it.
                    tracing::error!(
                        oldest,
                        requested,
                        "feed resume point below server retention, out-of-band resync required"
                    );
                    let _ = self
                        .events
                        .send(FeedEvent::ResyncRequired { oldest, requested })
                        .await;
                    break;
                }
                Err(err) => {
                    let _ = self.status.send(ConnectionStatus::Disconnected);
                    self.failures += 1;
                    metrics::counter!("plume_client_reconnects_total").increment(1);
                    tracing::warn!(
                        %url,
                        error = %err,
                        failures = self.failures,
                        "feed connection lost, backing off"
                    );
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if self.failures >= max {
                            let _ = self
                                .events
                                .send(FeedEvent::RetriesExhausted {
                                    attempts: self.failures,
                                })
                                .await;
                            break;
                        }
                    }
                    // Active/standby: move on to the next URL in order.
                    url_index += 1;
                    let delay = self.config.backoff.delay(self.failures.saturating_sub(1));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
        let _ = self.status.send(ConnectionStatus::Disconnected);
    }

    async fn run_connection(&mut self, url: &FeedUrl) -> Result<SessionEnd> {
        let conn = self
            .dialer
            .connect(url.addr, &url.server_name, self.config.connect_timeout)
            .await?;
        let (mut send, mut recv) = conn.open_bi().await?;
        let from_sequence = self
            .last_delivered
            .map(|seq| seq + 1)
            .or(self.config.resume_from);
        wire::write_message(&mut send, &Message::Resume { from_sequence }).await?;

        let max_frame_bytes = self.config.transport.max_frame_bytes;
        let mut scratch = BytesMut::with_capacity(64 * 1024);
        let hello = tokio::time::timeout(
            self.config.handshake_timeout,
            wire::read_message(&mut recv, max_frame_bytes, &mut scratch),
        )
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;
        let head = match hello {
            Some(Message::Hello { version, head }) => {
                // Reject before attempting to parse anything else.
                if version != PROTOCOL_VERSION {
                    bail!(
                        "protocol version mismatch: server speaks {version}, client speaks {PROTOCOL_VERSION}"
                    );
                }
                head
            }
            Some(other) => bail!("expected hello, got {other:?}"),
            None => bail!("feed stream ended during handshake"),
        };
        self.failures = 0;
        tracing::info!(%url, ?head, resume = ?from_sequence, "feed connected");

        // Catching up until delivery passes the head the server reported
        // at connect time.
        let mut catch_up_target = match (from_sequence, head) {
            (Some(from), Some(head)) if head >= from => Some(head),
            _ => None,
        };
        let _ = self.status.send(if catch_up_target.is_some() {
            ConnectionStatus::CatchingUp
        } else {
            ConnectionStatus::Live
        });

        loop {
            let message = tokio::select! {
                _ = self.shutdown.changed() => {
                    conn.close(0, b"shutdown");
                    return Ok(SessionEnd::Shutdown);
                }
                read = wire::read_message(&mut recv, max_frame_bytes, &mut scratch) => read?,
            };
            match message {
                Some(Message::Feed(envelope)) => {
                    if let Some(end) = self
                        .process_envelope(envelope, &mut catch_up_target)
                        .await?
                    {
                        return Ok(end);
                    }
                }
                Some(Message::Unavailable { oldest, requested }) => {
                    return Ok(SessionEnd::ResyncRequired { oldest, requested });
                }
                Some(Message::Error { message }) => bail!("server error: {message}"),
                Some(other) => bail!("unexpected message on feed stream: {other:?}"),
                None => bail!("feed stream ended"),
            }
        }
    }

    async fn process_envelope(
        &mut self,
        envelope: Envelope,
        catch_up_target: &mut Option<u64>,
    ) -> Result<Option<SessionEnd>> {
        if envelope.version != PROTOCOL_VERSION {
            bail!("unsupported envelope version {}", envelope.version);
        }
        for message in envelope.messages {
            if let Some(verifier) = &self.verifier {
                match verifier.verify(&message) {
                    Ok(Verification::Verified) => {}
                    Ok(Verification::Unverified) => {
                        metrics::counter!("plume_client_unverified_total").increment(1);
                        let _ = self.events.try_send(FeedEvent::Unverified {
                            sequence: message.sequence_number,
                        });
                    }
                    // Enforced mode: drop the message and tear the
                    // connection down.
                    Err(err) => {
                        return Err(err).context("feed signature verification failed");
                    }
                }
            }
            let next_expected = self
                .last_delivered
                .map(|last| last + 1)
                .or(self.config.resume_from);
            match sequence_action(next_expected, message.sequence_number) {
                SequenceAction::Duplicate => {
                    tracing::trace!(
                        sequence = message.sequence_number,
                        "skipping catch-up overlap"
                    );
                    continue;
                }
                // Never silently skip a sequence number; drop the
                // connection and resume from what we actually have.
                SequenceAction::Gap { expected } => bail!(
                    "sequence gap on feed stream: expected {expected}, got {}",
                    message.sequence_number
                ),
                SequenceAction::Deliver => {}
            }
            let sequence = message.sequence_number;
            if self.delivery.send(message).await.is_err() {
                return Ok(Some(SessionEnd::ConsumerGone));
            }
            self.last_delivered = Some(sequence);
            metrics::counter!("plume_client_delivered_total").increment(1);
            if let Some(target) = *catch_up_target {
                if sequence >= target {
                    *catch_up_target = None;
                    let _ = self.status.send(ConnectionStatus::Live);
                    tracing::debug!(sequence, "feed caught up");
                }
            }
        }
        if let Some(seq) = envelope.confirmed_sequence {
            let _ = self.events.try_send(FeedEvent::ConfirmedSequence(seq));
        }
        Ok(None)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SequenceAction {
    Deliver,
    Duplicate,
    Gap { expected: u64 },
}

// `next_expected` is the sequence this client is owed: last delivered plus
// one, or the configured resume point before anything has been delivered.
fn sequence_action(next_expected: Option<u64>, sequence: u64) -> SequenceAction {
    match next_expected {
        // No expectation yet: the first message fixes the start.
        None => SequenceAction::Deliver,
        Some(expected) if sequence < expected => SequenceAction::Duplicate,
        Some(expected) if sequence == expected => SequenceAction::Deliver,
        Some(expected) => SequenceAction::Gap { expected },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_fixes_start() {
        assert_eq!(sequence_action(None, 0), SequenceAction::Deliver);
        assert_eq!(sequence_action(None, 900), SequenceAction::Deliver);
    }

    #[test]
    fn in_order_delivery() {
        assert_eq!(sequence_action(Some(5), 5), SequenceAction::Deliver);
    }

    #[test]
    fn catch_up_overlap_is_skipped() {
        assert_eq!(sequence_action(Some(5), 4), SequenceAction::Duplicate);
        assert_eq!(sequence_action(Some(5), 1), SequenceAction::Duplicate);
    }

    #[test]
    fn gaps_are_faults_not_skips() {
        assert_eq!(
            sequence_action(Some(5), 6),
            SequenceAction::Gap { expected: 5 }
        );
        assert_eq!(
            sequence_action(Some(5), 400),
            SequenceAction::Gap { expected: 5 }
        );
    }

    #[test]
    fn resume_point_anchors_expectation_before_first_delivery() {
        // A server that lost its history must not be allowed to skip past
        // the requested resume point silently.
        assert_eq!(sequence_action(Some(3), 7), SequenceAction::Gap { expected: 3 });
        assert_eq!(sequence_action(Some(3), 3), SequenceAction::Deliver);
    }
}

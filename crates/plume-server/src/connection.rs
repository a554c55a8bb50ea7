// Per-connection protocol: Resume/Hello handshake, backlog catch-up, then
// live tail delivery.
use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use plume_backlog::BacklogError;
use plume_transport::FeedConn;
use plume_wire::{Envelope, FeedMessage, Message, PROTOCOL_VERSION};
use quinn::{RecvStream, SendStream};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::codec::{read_message_limited, write_message};
use crate::{BroadcastServer, Outbound, ServerConfig};

// Application close codes surfaced to the peer.
const CLOSE_DONE: u32 = 0;
const CLOSE_SLOW_CONSUMER: u32 = 1;
const CLOSE_PROTOCOL_FAULT: u32 = 2;

pub(crate) async fn handle_connection(server: Arc<BroadcastServer>, conn: FeedConn) -> Result<()> {
    let config = server.config().clone();
    let peer = conn.info().peer_addr;

    // The subscriber opens one bidirectional stream and leads with Resume.
    let (mut send, recv, first) = tokio::time::timeout(config.handshake_timeout, async {
        let (send, mut recv) = conn.accept_bi().await?;
        let mut scratch = BytesMut::with_capacity(4 * 1024);
        let first = read_message_limited(&mut recv, config.max_frame_bytes, &mut scratch).await?;
        Result::<_>::Ok((send, recv, first))
    })
    .await
    .map_err(|_| anyhow!("handshake with {peer} timed out"))??;

    let from_sequence = match first {
        Some(Message::Resume { from_sequence }) => from_sequence,
        // Peer went away before asking for anything.
        None => return Ok(()),
        Some(other) => {
            let _ = write_message(
                &mut send,
                &Message::Error {
                    message: "expected resume".to_string(),
                },
            )
            .await;
            conn.close(CLOSE_PROTOCOL_FAULT, b"expected resume");
            bail!("unexpected first message from {peer}: {other:?}");
        }
    };

    write_message(
        &mut send,
        &Message::Hello {
            version: PROTOCOL_VERSION,
            head: server.head(),
        },
    )
    .await?;

    // Register for live delivery *before* snapshotting the backlog, so a
    // broadcast racing this handshake lands in both; the writer dedups
    // the overlap by sequence. Registering after the snapshot could lose
    // whatever was appended in between.
    let mut registration = server.register_subscriber();

    let catch_up = match from_sequence {
        Some(from) => match server.range(from) {
            Ok(messages) => messages,
            Err(BacklogError::TooOld { oldest, requested }) => {
                tracing::info!(%peer, oldest, requested, "resume point below retention");
                write_message(&mut send, &Message::Unavailable { oldest, requested }).await?;
                let _ = send.finish();
                conn.close(CLOSE_DONE, b"resync required");
                return Ok(());
            }
            Err(err) => return Err(err).context("backlog range"),
        },
        None => Vec::new(),
    };

    // First live sequence the writer owes this subscriber. None means a
    // "from now" subscription: deliver from whatever arrives first.
    let next_sequence = match (catch_up.last(), from_sequence) {
        (Some(last), _) => Some(last.sequence_number + 1),
        (None, Some(from)) => Some(from),
        (None, None) => None,
    };

    replay_catch_up(&mut send, &catch_up, &config).await?;
    metrics::counter!("plume_server_catchup_messages_total").increment(catch_up.len() as u64);
    tracing::debug!(%peer, replayed = catch_up.len(), "catch-up complete, switching to live");

    // After Resume the subscriber must stay quiet; any further bytes are
    // a per-connection fault that drops the connection.
    let mut reader = tokio::spawn(read_guard(recv, config.max_frame_bytes));

    let exit = run_live_writer(
        &mut send,
        &mut registration.queue,
        &mut registration.cancel,
        &mut reader,
        &config,
        next_sequence,
    )
    .await;
    reader.abort();

    match exit {
        Ok(WriterExit::Evicted) => {
            conn.close(CLOSE_SLOW_CONSUMER, b"slow consumer");
            tracing::info!(%peer, "closed slow feed subscriber");
        }
        Ok(WriterExit::PeerClosed) | Ok(WriterExit::Unregistered) => {
            conn.close(CLOSE_DONE, b"done");
        }
        Err(err) => {
            conn.close(CLOSE_DONE, b"write failed");
            tracing::info!(%peer, error = %err, "feed subscriber stream closed");
        }
    }
    Ok(())
}

// Replay the catch-up snapshot in envelope-sized chunks.
async fn replay_catch_up(
    send: &mut SendStream,
    messages: &[FeedMessage],
    config: &ServerConfig,
) -> Result<()> {
    let mut start = 0usize;
    while start < messages.len() {
        let mut end = start;
        let mut bytes = 0usize;
        while end < messages.len() && end - start < config.batch_max_messages {
            let len = messages[end].wire_len();
            if end > start && bytes + len > config.batch_max_bytes {
                break;
            }
            bytes += len;
            end += 1;
        }
        let envelope = Envelope::new(messages[start..end].to_vec());
        write_message(send, &Message::Feed(envelope)).await?;
        start = end;
    }
    Ok(())
}

enum WriterExit {
    // Fan-out flagged this subscriber as too slow.
    Evicted,
    // The peer finished or broke its half of the stream.
    PeerClosed,
    // The server dropped the subscriber queue (shutdown).
    Unregistered,
}

// Decide whether a queued live message is owed to this subscriber, or is
// the catch-up overlap. Everything at or past `next_sequence` is written
// out; the client enforces gap detection on its side.
fn take_next(next_sequence: &mut Option<u64>, message: &FeedMessage) -> bool {
    match *next_sequence {
        Some(next) if message.sequence_number < next => false,
        _ => {
            *next_sequence = Some(message.sequence_number + 1);
            true
        }
    }
}

// Drain the subscriber queue and write envelopes, coalescing by count,
// bytes, and a flush deadline.
async fn run_live_writer(
    send: &mut SendStream,
    queue: &mut mpsc::Receiver<Outbound>,
    cancel: &mut watch::Receiver<bool>,
    reader: &mut tokio::task::JoinHandle<()>,
    config: &ServerConfig,
    mut next_sequence: Option<u64>,
) -> Result<WriterExit> {
    let mut pending_confirm: Option<u64> = None;
    loop {
        let first = tokio::select! {
            _ = cancel.changed() => return Ok(WriterExit::Evicted),
            _ = &mut *reader => return Ok(WriterExit::PeerClosed),
            item = queue.recv() => match item {
                Some(item) => item,
                None => return Ok(WriterExit::Unregistered),
            },
        };

        let mut batch: Vec<FeedMessage> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut exit = None;
        match first {
            Outbound::Confirmed(seq) => pending_confirm = Some(seq),
            Outbound::Message(message) => {
                if take_next(&mut next_sequence, &message) {
                    batch_bytes += message.wire_len();
                    batch.push((*message).clone());
                }
            }
        }

        // Collect until a flush limit trips or the deadline passes.
        if !batch.is_empty() {
            let deadline = tokio::time::sleep(config.batch_max_delay);
            tokio::pin!(deadline);
            while batch.len() < config.batch_max_messages && batch_bytes < config.batch_max_bytes {
                tokio::select! {
                    _ = cancel.changed() => {
                        exit = Some(WriterExit::Evicted);
                        break;
                    }
                    _ = &mut deadline => break,
                    item = queue.recv() => match item {
                        Some(Outbound::Message(message)) => {
                            if take_next(&mut next_sequence, &message) {
                                batch_bytes += message.wire_len();
                                batch.push((*message).clone());
                            }
                        }
                        // A confirmation flushes promptly with the batch.
                        Some(Outbound::Confirmed(seq)) => {
                            pending_confirm = Some(seq);
                            break;
                        }
                        None => {
                            exit = Some(WriterExit::Unregistered);
                            break;
                        }
                    },
                }
            }
        }

        if !batch.is_empty() || pending_confirm.is_some() {
            let envelope = Envelope {
                version: PROTOCOL_VERSION,
                messages: batch,
                confirmed_sequence: pending_confirm.take(),
            };
            write_message(send, &Message::Feed(envelope)).await?;
        }
        if let Some(exit) = exit {
            return Ok(exit);
        }
    }
}

async fn read_guard(mut recv: RecvStream, max_frame_bytes: usize) {
    let mut scratch = BytesMut::with_capacity(1024);
    loop {
        match read_message_limited(&mut recv, max_frame_bytes, &mut scratch).await {
            Ok(Some(message)) => {
                tracing::warn!(?message, "unexpected message from feed subscriber");
                break;
            }
            // Clean FIN: the subscriber is going away.
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "malformed bytes from feed subscriber");
                break;
            }
        }
    }
}

// Broadcast feed client: maintains a live, ordered, gap-free stream from
// one of a list of upstream servers, reconnecting automatically.
mod backoff;
mod client;
mod config;
mod wire;

pub use backoff::BackoffConfig;
pub use client::{BroadcastClient, ClientHandle, ConnectionStatus, FeedEvent};
pub use config::{ClientConfig, FeedUrl, InvalidFeedUrl};

/// Log line emitted by consumers when a message's claimed block hash does
/// not match the locally computed one. Kept as a constant so operational
/// tooling can match on it.
pub const BLOCK_HASH_MISMATCH_LOG: &str = "feed message block hash mismatch";

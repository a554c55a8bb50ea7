// Bounded in-memory retention window for feed replay.
//
// Single appender (the hosting broadcast server), any number of
// concurrent range readers. All state lives behind one mutex; range
// copies message handles under the lock so readers never observe a
// partially appended or partially evicted store. Payload bytes are
// refcounted, so the copies are cheap.
use parking_lot::Mutex;
use plume_wire::FeedMessage;
use std::collections::VecDeque;

pub type Result<T> = std::result::Result<T, BacklogError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BacklogError {
    // A non-contiguous append is an upstream sequencing fault; the store
    // is left untouched and the caller must treat this as fatal.
    #[error("non-contiguous append (expected {expected}, got {got})")]
    NonContiguous { expected: u64, got: u64 },
    #[error("resume point too old (oldest {oldest}, requested {requested})")]
    TooOld { oldest: u64, requested: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct BacklogConfig {
    // Max retained message count.
    pub max_messages: usize,
    // Max retained payload bytes, as reported by FeedMessage::wire_len.
    pub max_bytes: usize,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            max_messages: 4096,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct BacklogState {
    entries: VecDeque<FeedMessage>,
    bytes: usize,
    // Sequence of the newest message removed by eviction or confirm;
    // anchors the contiguity check while the store is momentarily empty.
    last_removed: Option<u64>,
}

impl BacklogState {
    // Next sequence this backlog will accept. None until the first-ever
    // append, which fixes the feed's starting sequence.
    fn expected(&self) -> Option<u64> {
        match self.entries.back() {
            Some(newest) => Some(newest.sequence_number + 1),
            None => self.last_removed.map(|seq| seq + 1),
        }
    }

    fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.sequence_number)
    }
}

/// Ordered, bounded store of recent feed messages keyed by sequence.
///
/// ```
/// use bytes::Bytes;
/// use plume_backlog::Backlog;
/// use plume_wire::FeedMessage;
///
/// let backlog = Backlog::default();
/// backlog
///     .append(FeedMessage::new(1, Bytes::from_static(b"a"), None))
///     .expect("append");
/// assert_eq!(backlog.head(), Some(1));
/// assert_eq!(backlog.range(1).expect("range").len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Backlog {
    state: Mutex<BacklogState>,
    config: BacklogConfig,
}

impl Backlog {
    pub fn new(config: BacklogConfig) -> Self {
        Self {
            state: Mutex::new(BacklogState::default()),
            config,
        }
    }

    /// Append the next message and apply the eviction policy.
    ///
    /// The sequence must be exactly one greater than the newest held (or
    /// than the last removed sequence while momentarily empty); anything
    /// else is rejected without touching existing state.
    pub fn append(&self, message: FeedMessage) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(expected) = state.expected() {
            if message.sequence_number != expected {
                return Err(BacklogError::NonContiguous {
                    expected,
                    got: message.sequence_number,
                });
            }
        }
        state.bytes += message.wire_len();
        state.entries.push_back(message);

        // Evict a contiguous oldest-first prefix; the newest message is
        // always retained even when it alone exceeds the byte budget.
        while state.entries.len() > 1
            && (state.entries.len() > self.config.max_messages
                || state.bytes > self.config.max_bytes)
        {
            let removed = state.entries.pop_front().expect("non-empty");
            state.bytes -= removed.wire_len();
            state.last_removed = Some(removed.sequence_number);
        }
        Ok(())
    }

    /// Every retained message with sequence >= `from`, in order.
    ///
    /// `TooOld` when `from` predates retention (the caller must resync out
    /// of band); an empty vec when `from` is at or beyond the head.
    pub fn range(&self, from: u64) -> Result<Vec<FeedMessage>> {
        let state = self.state.lock();
        let oldest = match state.oldest() {
            Some(oldest) => oldest,
            // Nothing retained: either a fresh feed (anything goes) or a
            // fully pruned one, where only sequences past the prune point
            // can still be served (as "nothing to replay yet").
            None => match state.expected() {
                Some(expected) if from < expected => {
                    return Err(BacklogError::TooOld {
                        oldest: expected,
                        requested: from,
                    });
                }
                _ => return Ok(Vec::new()),
            },
        };
        if from < oldest {
            return Err(BacklogError::TooOld {
                oldest,
                requested: from,
            });
        }
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.sequence_number >= from)
            .cloned()
            .collect())
    }

    /// Newest retained sequence number, if any.
    pub fn head(&self) -> Option<u64> {
        let state = self.state.lock();
        state.entries.back().map(|entry| entry.sequence_number)
    }

    pub fn oldest(&self) -> Option<u64> {
        self.state.lock().oldest()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Drop the contiguous prefix up to and including `seq`.
    ///
    /// Called when the parent chain confirms settlement through `seq`;
    /// replay below that point is served by chain history instead.
    pub fn confirm(&self, seq: u64) {
        let mut state = self.state.lock();
        while let Some(front) = state.entries.front() {
            if front.sequence_number > seq {
                break;
            }
            let removed = state.entries.pop_front().expect("non-empty");
            state.bytes -= removed.wire_len();
            state.last_removed = Some(removed.sequence_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(seq: u64) -> FeedMessage {
        FeedMessage::new(seq, Bytes::from_static(b"payload"), None)
    }

    fn filled(first: u64, last: u64, config: BacklogConfig) -> Backlog {
        let backlog = Backlog::new(config);
        for seq in first..=last {
            backlog.append(message(seq)).expect("append");
        }
        backlog
    }

    #[test]
    fn first_append_fixes_starting_sequence() {
        let backlog = Backlog::default();
        backlog.append(message(100)).expect("append");
        assert_eq!(backlog.head(), Some(100));
        assert_eq!(backlog.oldest(), Some(100));
    }

    #[test]
    fn contiguous_appends_accumulate() {
        let backlog = filled(1, 5, BacklogConfig::default());
        assert_eq!(backlog.head(), Some(5));
        assert_eq!(backlog.len(), 5);
        let range = backlog.range(1).expect("range");
        let sequences: Vec<u64> = range.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn non_contiguous_append_rejected_without_corruption() {
        let backlog = filled(1, 3, BacklogConfig::default());
        let err = backlog.append(message(5)).expect_err("gap");
        assert_eq!(err, BacklogError::NonContiguous { expected: 4, got: 5 });
        // Duplicate of an already-held sequence is rejected the same way.
        let err = backlog.append(message(3)).expect_err("duplicate");
        assert_eq!(err, BacklogError::NonContiguous { expected: 4, got: 3 });
        // Store unchanged; the expected next still appends cleanly.
        assert_eq!(backlog.head(), Some(3));
        assert_eq!(backlog.len(), 3);
        backlog.append(message(4)).expect("append");
        assert_eq!(backlog.head(), Some(4));
    }

    #[test]
    fn count_eviction_keeps_newest_contiguous_suffix() {
        let config = BacklogConfig {
            max_messages: 3,
            ..BacklogConfig::default()
        };
        // Appends 1..=10 with capacity 3: retained suffix is 8..=10.
        let backlog = filled(1, 10, config);
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.oldest(), Some(8));
        assert_eq!(backlog.head(), Some(10));

        let range = backlog.range(8).expect("range");
        assert_eq!(range.len(), 3);
        let err = backlog.range(7).expect_err("too old");
        assert_eq!(err, BacklogError::TooOld { oldest: 8, requested: 7 });
    }

    #[test]
    fn byte_eviction_drops_oldest_first() {
        let per_message = message(1).wire_len();
        let config = BacklogConfig {
            max_messages: 1000,
            max_bytes: per_message * 2,
        };
        let backlog = filled(1, 5, config);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.oldest(), Some(4));
        assert_eq!(backlog.bytes(), per_message * 2);
    }

    #[test]
    fn oversized_message_is_still_retained() {
        let config = BacklogConfig {
            max_messages: 10,
            max_bytes: 1,
        };
        let backlog = Backlog::new(config);
        backlog.append(message(1)).expect("append");
        assert_eq!(backlog.len(), 1);
        backlog.append(message(2)).expect("append");
        // Only the newest survives a byte budget smaller than one message.
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.head(), Some(2));
    }

    #[test]
    fn range_beyond_head_is_empty() {
        let backlog = filled(1, 3, BacklogConfig::default());
        assert!(backlog.range(4).expect("range").is_empty());
        assert!(backlog.range(400).expect("range").is_empty());
    }

    #[test]
    fn range_on_fresh_backlog_is_empty() {
        let backlog = Backlog::default();
        assert!(backlog.range(1).expect("range").is_empty());
        assert!(backlog.range(50).expect("range").is_empty());
    }

    #[test]
    fn confirm_prunes_prefix_and_preserves_contiguity() {
        let backlog = filled(1, 6, BacklogConfig::default());
        backlog.confirm(4);
        assert_eq!(backlog.oldest(), Some(5));
        assert_eq!(backlog.len(), 2);
        let err = backlog.range(4).expect_err("pruned");
        assert_eq!(err, BacklogError::TooOld { oldest: 5, requested: 4 });
    }

    #[test]
    fn confirm_past_head_empties_store_but_keeps_expectation() {
        let backlog = filled(1, 3, BacklogConfig::default());
        backlog.confirm(10);
        assert!(backlog.is_empty());
        assert_eq!(backlog.bytes(), 0);
        // Contiguity is still anchored at the removed tail, not reset.
        let err = backlog.append(message(10)).expect_err("gap");
        assert_eq!(err, BacklogError::NonContiguous { expected: 4, got: 10 });
        backlog.append(message(4)).expect("append");
        assert_eq!(backlog.head(), Some(4));
    }

    #[test]
    fn range_on_emptied_store_distinguishes_old_from_future() {
        let backlog = filled(1, 3, BacklogConfig::default());
        backlog.confirm(3);
        let err = backlog.range(2).expect_err("too old");
        assert_eq!(err, BacklogError::TooOld { oldest: 4, requested: 2 });
        assert!(backlog.range(4).expect("range").is_empty());
    }

    #[test]
    fn byte_accounting_tracks_eviction() {
        let backlog = filled(1, 4, BacklogConfig::default());
        let before = backlog.bytes();
        backlog.confirm(2);
        assert_eq!(backlog.bytes(), before - 2 * message(1).wire_len());
    }
}

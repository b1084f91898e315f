//! Reassembly tracker: collects fragments per message id until complete.
//!
//! Each id moves `Unseen → Collecting → Complete`. A completed id stays
//! known so late or repeated fragments cannot bring it back. The one way
//! back to `Collecting` is the request→ack transition: a reply reuses the
//! request's id, so the first ack fragment seen for a request id resets the
//! entry and switches its role.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use pulse_core::wire::{DecodedFragment, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Complete,
}

/// A fully reassembled message, handed up exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub id: MessageId,
    pub is_ack: bool,
    pub payload: Bytes,
}

/// Why a fragment changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The id already completed in this role.
    AlreadyComplete,
    /// Request fragment for an id that has moved on to its reply.
    StaleRequest,
    /// Fragment disagrees with the total the first fragment declared.
    TotalMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Stored; the message is still missing fragments.
    Progress { received: usize, total: u16 },
    /// This fragment completed the message.
    Complete(CompletedMessage),
    Ignored(IgnoreReason),
}

#[derive(Debug)]
struct MessageState {
    total: u16,
    fragments: BTreeMap<u16, Bytes>,
    phase: Phase,
    is_ack: bool,
    started_at: Instant,
}

impl MessageState {
    fn collecting(total: u16, is_ack: bool, now: Instant) -> Self {
        Self {
            total,
            fragments: BTreeMap::new(),
            phase: Phase::Collecting,
            is_ack,
            started_at: now,
        }
    }

    /// Reply reuses this id: forget the request's fragments, keep the id.
    fn become_ack(&mut self, total: u16, now: Instant) {
        self.total = total;
        self.fragments.clear();
        self.phase = Phase::Collecting;
        self.is_ack = true;
        self.started_at = now;
    }

    fn assemble(&mut self) -> Bytes {
        let len = self.fragments.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for data in self.fragments.values() {
            out.extend_from_slice(data);
        }
        self.fragments.clear();
        self.phase = Phase::Complete;
        out.freeze()
    }
}

/// Per-id reassembly state for every message this device has sent or heard.
#[derive(Debug, Default)]
pub struct ReassemblyTracker {
    messages: HashMap<MessageId, MessageState>,
}

impl ReassemblyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message this device is about to broadcast. It is known in
    /// full already, so it starts `Complete` and echoes of it are ignored.
    pub fn register_outbound(&mut self, id: MessageId, is_ack: bool, total: u16, now: Instant) {
        let state = self
            .messages
            .entry(id)
            .or_insert_with(|| MessageState::collecting(total, is_ack, now));
        state.total = total;
        state.is_ack = is_ack;
        state.fragments.clear();
        state.phase = Phase::Complete;
    }

    /// Feed one decoded fragment.
    pub fn accept(&mut self, fragment: DecodedFragment, now: Instant) -> Accepted {
        let DecodedFragment {
            id,
            total,
            sequence,
            is_ack,
            data,
        } = fragment;

        let state = self
            .messages
            .entry(id)
            .or_insert_with(|| MessageState::collecting(total, is_ack, now));

        if is_ack && !state.is_ack {
            tracing::debug!(message_id = id, total, "request id switched to reply");
            state.become_ack(total, now);
        } else if state.phase == Phase::Complete {
            return Accepted::Ignored(IgnoreReason::AlreadyComplete);
        } else if !is_ack && state.is_ack {
            return Accepted::Ignored(IgnoreReason::StaleRequest);
        } else if total != state.total {
            tracing::debug!(
                message_id = id,
                expected = state.total,
                got = total,
                "fragment total mismatch, dropping"
            );
            return Accepted::Ignored(IgnoreReason::TotalMismatch);
        }

        // duplicates overwrite with identical data
        state.fragments.insert(sequence, data);

        if state.fragments.len() < state.total as usize {
            return Accepted::Progress {
                received: state.fragments.len(),
                total: state.total,
            };
        }

        let payload = state.assemble();
        tracing::trace!(
            message_id = id,
            is_ack = state.is_ack,
            len = payload.len(),
            "message reassembled"
        );
        Accepted::Complete(CompletedMessage {
            id,
            is_ack: state.is_ack,
            payload,
        })
    }

    pub fn phase(&self, id: MessageId) -> Option<Phase> {
        self.messages.get(&id).map(|s| s.phase)
    }

    /// Number of ids still missing fragments.
    pub fn in_progress(&self) -> usize {
        self.messages
            .values()
            .filter(|s| s.phase == Phase::Collecting)
            .count()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop partial reassemblies that started more than `max_age` ago.
    /// Completed ids are kept. Returns how many were evicted.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.messages.len();
        self.messages.retain(|id, state| {
            let stale = state.phase == Phase::Collecting
                && now.saturating_duration_since(state.started_at) >= max_age;
            if stale {
                tracing::debug!(
                    message_id = id,
                    received = state.fragments.len(),
                    total = state.total,
                    "evicting stale partial message"
                );
            }
            !stale
        });
        before - self.messages.len()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.messages.clear();
    }
}

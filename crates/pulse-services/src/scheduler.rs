//! Broadcast scheduler: puts one frame on the medium per tick.
//!
//! Queued messages are served round-robin: each tick sends the next frame
//! of the entry under the cursor and moves the cursor on, so every queued
//! message gets one frame per pass and none is starved. An entry is removed
//! once its last frame has gone out. When the queue runs dry the scheduler
//! stops itself; enqueueing starts it again.
//!
//! The tick is a plain function. The node actor calls it from a timer, tests
//! call it by hand.

use std::collections::VecDeque;

use bytes::Bytes;
use pulse_core::wire::MessageId;

use crate::medium::FrameSender;

#[derive(Debug)]
struct QueueEntry {
    id: MessageId,
    frames: VecDeque<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame left the device. `remaining` is what is left of its message.
    Sent { id: MessageId, remaining: usize },
    /// The medium refused the frame; it stays queued for the next pass.
    SendFailed { id: MessageId },
    /// Nothing queued; the scheduler has stopped itself.
    Idle,
    /// The scheduler is not running.
    Stopped,
}

#[derive(Debug, Default)]
pub struct BroadcastScheduler {
    queue: Vec<QueueEntry>,
    cursor: usize,
    running: bool,
}

impl BroadcastScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message's frames behind everything already queued.
    pub fn enqueue(&mut self, id: MessageId, frames: Vec<Bytes>) {
        if frames.is_empty() {
            return;
        }
        tracing::trace!(message_id = id, frames = frames.len(), "message queued for broadcast");
        self.queue.push(QueueEntry {
            id,
            frames: frames.into(),
        });
    }

    /// Returns true if the scheduler was not already running.
    pub fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.running, true)
    }

    /// Stop ticking and reset the cursor. Queued frames are kept.
    pub fn stop(&mut self) {
        self.running = false;
        self.cursor = 0;
    }

    /// Drop every queued frame and stop.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Messages still holding unsent frames.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_frames(&self) -> usize {
        self.queue.iter().map(|e| e.frames.len()).sum()
    }

    pub fn tick(&mut self, sender: &dyn FrameSender) -> TickOutcome {
        if !self.running {
            return TickOutcome::Stopped;
        }
        if self.queue.is_empty() {
            self.stop();
            return TickOutcome::Idle;
        }
        if self.cursor >= self.queue.len() {
            self.cursor = 0;
        }

        let entry = &mut self.queue[self.cursor];
        let id = entry.id;
        let Some(frame) = entry.frames.front() else {
            self.queue.remove(self.cursor);
            return self.tick(sender);
        };

        if let Err(e) = sender.send(frame) {
            tracing::warn!(error = %e, message_id = id, "frame send failed, will retry next pass");
            self.advance();
            return TickOutcome::SendFailed { id };
        }

        entry.frames.pop_front();
        let remaining = entry.frames.len();
        if remaining == 0 {
            // cursor now points at the entry after the removed one
            self.queue.remove(self.cursor);
            if self.cursor >= self.queue.len() {
                self.cursor = 0;
            }
        } else {
            self.advance();
        }
        TickOutcome::Sent { id, remaining }
    }

    fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.queue.len() {
            self.cursor = 0;
        }
    }
}

//! Broadcast medium capabilities.
//!
//! The radio is supplied by the host platform. The node only needs to push
//! a frame out (`FrameSender`) and be told about frames heard over the air
//! (`FrameScanner`). `SimMedium` implements both in memory with controllable
//! reachability, loss, duplication and reordering.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

/// Callback invoked for every frame heard.
pub type FrameCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Best-effort, non-blocking frame transmission.
pub trait FrameSender: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Subscription to frames observed on the medium.
pub trait FrameScanner: Send + Sync {
    fn subscribe(&self, on_frame: FrameCallback) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("medium send failed: {0}")]
    Send(#[from] std::io::Error),
    #[error("medium unavailable: {0}")]
    Unavailable(String),
    #[error("scanner already subscribed")]
    AlreadySubscribed,
}

// ── Simulated medium ─────────────────────────────────────────────────────────

/// In-memory broadcast medium shared by any number of endpoints.
///
/// Every frame sent by one endpoint reaches every other endpoint it can
/// hear, synchronously, unless frames are being held for reordering.
#[derive(Clone, Default)]
pub struct SimMedium {
    inner: Arc<Mutex<SimInner>>,
}

#[derive(Default)]
struct SimInner {
    subscribers: Vec<(usize, Arc<dyn Fn(Bytes) + Send + Sync>)>,
    endpoints: usize,
    /// Unordered pairs that cannot hear each other.
    blocked: HashSet<(usize, usize)>,
    /// Drop every Nth transmitted frame.
    drop_every: Option<u64>,
    duplicate: bool,
    send_fails: bool,
    transmitted: u64,
    sent_by: Vec<u64>,
    held: Option<Vec<(usize, Bytes)>>,
}

impl SimMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new device to the medium.
    pub fn endpoint(&self) -> SimEndpoint {
        let mut inner = self.lock();
        let index = inner.endpoints;
        inner.endpoints += 1;
        inner.sent_by.push(0);
        SimEndpoint {
            index,
            medium: self.clone(),
        }
    }

    /// Make two endpoints (un)able to hear each other.
    pub fn set_reachable(&self, a: &SimEndpoint, b: &SimEndpoint, reachable: bool) {
        let pair = (a.index.min(b.index), a.index.max(b.index));
        let mut inner = self.lock();
        if reachable {
            inner.blocked.remove(&pair);
        } else {
            inner.blocked.insert(pair);
        }
    }

    /// Lose every `n`th frame transmitted on the medium.
    pub fn drop_every(&self, n: Option<u64>) {
        self.lock().drop_every = n.filter(|&n| n > 0);
    }

    /// Deliver every frame twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.lock().duplicate = duplicate;
    }

    /// Make every send fail with a transport error.
    pub fn set_send_fails(&self, fails: bool) {
        self.lock().send_fails = fails;
    }

    /// Stop delivering; queue frames until [`SimMedium::release`].
    pub fn hold(&self) {
        let mut inner = self.lock();
        if inner.held.is_none() {
            inner.held = Some(Vec::new());
        }
    }

    /// Deliver held frames after letting `reorder` permute them.
    pub fn release(&self, reorder: impl FnOnce(&mut Vec<(usize, Bytes)>)) {
        let held = self.lock().held.take();
        if let Some(mut frames) = held {
            reorder(&mut frames);
            for (from, frame) in frames {
                self.deliver(from, frame);
            }
        }
    }

    /// Frames successfully put on the medium by `endpoint`.
    pub fn sent_by(&self, endpoint: &SimEndpoint) -> u64 {
        self.lock().sent_by[endpoint.index]
    }

    pub fn transmitted(&self) -> u64 {
        self.lock().transmitted
    }

    fn transmit(&self, from: usize, frame: &[u8]) -> Result<(), TransportError> {
        let frame = Bytes::copy_from_slice(frame);
        {
            let mut inner = self.lock();
            if inner.send_fails {
                return Err(TransportError::Unavailable("simulated send failure".into()));
            }
            inner.transmitted += 1;
            inner.sent_by[from] += 1;
            if let Some(n) = inner.drop_every {
                if inner.transmitted % n == 0 {
                    return Ok(());
                }
            }
            if let Some(held) = inner.held.as_mut() {
                held.push((from, frame));
                return Ok(());
            }
        }
        self.deliver(from, frame);
        Ok(())
    }

    fn deliver(&self, from: usize, frame: Bytes) {
        // callbacks run outside the lock
        let (targets, copies) = {
            let inner = self.lock();
            let targets: Vec<_> = inner
                .subscribers
                .iter()
                .filter(|(to, _)| {
                    *to != from && !inner.blocked.contains(&(from.min(*to), from.max(*to)))
                })
                .map(|(_, cb)| cb.clone())
                .collect();
            (targets, if inner.duplicate { 2 } else { 1 })
        };
        for callback in targets {
            for _ in 0..copies {
                callback(frame.clone());
            }
        }
    }
}

/// One device's attachment to a [`SimMedium`].
#[derive(Clone)]
pub struct SimEndpoint {
    index: usize,
    medium: SimMedium,
}

impl SimEndpoint {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl FrameSender for SimEndpoint {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.medium.transmit(self.index, frame)
    }
}

impl FrameScanner for SimEndpoint {
    fn subscribe(&self, on_frame: FrameCallback) -> Result<(), TransportError> {
        let mut inner = self.medium.lock();
        if inner.subscribers.iter().any(|(i, _)| *i == self.index) {
            return Err(TransportError::AlreadySubscribed);
        }
        inner.subscribers.push((self.index, Arc::from(on_frame)));
        Ok(())
    }
}

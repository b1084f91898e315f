//! Relay node: the single owner of all protocol state.
//!
//! `RelayNode` runs as one tokio task. Everything that touches the codec,
//! reassembly tracker, scheduler, relay layer or peer tracker arrives as a
//! [`Command`] on one mpsc channel: frames from the scanner callback, API
//! requests from [`NodeHandle`], and results from backend calls. Backend
//! calls run in their own tasks under a timeout and report back through the
//! same channel, so the actor itself never waits on the network.
//!
//! The scheduler timer exists only while the scheduler runs. Dropping the
//! `Interval` cancels it. With no tick interval configured the node never
//! ticks on its own and [`NodeHandle::tick`] steps it by hand.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pulse_core::config::PulseConfig;
use pulse_core::message::PayloadError;
use pulse_core::wire::{decode, EncodeOptions, FragmentCodec, MessageId, WireError};
use pulse_core::RelayMessage;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::backend::{BackendError, CheckOutcome, IncidentReport, RelayBackend, RelayQueryRequest};
use crate::clock::Clock;
use crate::medium::{FrameScanner, FrameSender, TransportError};
use crate::peer::PeerActivity;
use crate::reassembly::{Accepted, ReassemblyTracker};
use crate::relay::{NewQuery, NewReport, RelayAction, RelayLayer, RelaySettings, ReplyRoute};
use crate::scheduler::{BroadcastScheduler, TickOutcome};

const COMMAND_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub device_id: String,
    pub fragment_capacity: usize,
    /// `None` = manual stepping only.
    pub tick_interval: Option<Duration>,
    pub backend_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    /// `None` = partial reassemblies are never evicted.
    pub reassembly_max_age: Option<Duration>,
    pub liveness: Duration,
}

impl NodeSettings {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            fragment_capacity: pulse_core::wire::DEFAULT_FRAGMENT_CAPACITY,
            tick_interval: Some(Duration::from_millis(250)),
            backend_timeout: Duration::from_secs(20),
            dedup_capacity: 4096,
            dedup_ttl: Duration::from_secs(3600),
            reassembly_max_age: Some(Duration::from_secs(120)),
            liveness: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            device_id: config.node.device_id.clone(),
            fragment_capacity: config.medium.fragment_capacity,
            tick_interval: Some(config.medium.tick_interval()),
            backend_timeout: config.relay.backend_timeout(),
            dedup_capacity: config.relay.dedup_capacity,
            dedup_ttl: config.relay.dedup_ttl(),
            reassembly_max_age: config.relay.reassembly_max_age(),
            liveness: config.peers.liveness(),
        }
    }

    /// Tick only when [`NodeHandle::tick`] is called.
    pub fn manual(mut self) -> Self {
        self.tick_interval = None;
        self
    }
}

/// Outcomes published to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Response { query_id: String, text: String },
    QueryFailed { query_id: String, error: String },
    ReportStored { report_id: String },
    ReportFailed { report_id: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub device_id: String,
    pub online: bool,
    pub active_peers: usize,
    pub active_devices: Vec<String>,
    pub queued_messages: usize,
    pub queued_frames: usize,
    pub partial_messages: usize,
    pub pending_queries: usize,
    pub pending_reports: usize,
    pub scheduler_running: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("relay node is not running")]
    Closed,
    #[error("cannot frame message: {0}")]
    Wire(#[from] WireError),
    #[error("cannot encode message: {0}")]
    Payload(#[from] PayloadError),
    #[error("medium error: {0}")]
    Transport(#[from] TransportError),
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Frame(Bytes),
    SendQuery {
        query: NewQuery,
        reply: Reply<Result<String, NodeError>>,
    },
    SendResponse {
        query_id: String,
        text: String,
        reply: Reply<Result<(), NodeError>>,
    },
    SendReport {
        report: NewReport,
        reply: Reply<Result<String, NodeError>>,
    },
    AnnouncePresence {
        reply: Reply<Result<(), NodeError>>,
    },
    Tick {
        reply: Reply<TickOutcome>,
    },
    StartScheduler {
        reply: Reply<bool>,
    },
    StopScheduler {
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    Status {
        reply: Reply<NodeStatus>,
    },
    QueryAnswered {
        query_id: String,
        route: ReplyRoute,
        result: Result<String, String>,
    },
    ReportStored {
        report_id: String,
        route: ReplyRoute,
        result: Result<(), String>,
    },
    PollResult {
        query_id: String,
        result: Result<CheckOutcome, String>,
    },
    Shutdown,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Cheap, cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    /// Ask a question. Returns the query id the answer will carry.
    pub async fn send_query(&self, query: NewQuery) -> Result<String, NodeError> {
        self.request(|reply| Command::SendQuery { query, reply }).await?
    }

    /// Answer a query heard on the medium.
    pub async fn send_response(&self, query_id: &str, text: &str) -> Result<(), NodeError> {
        let query_id = query_id.to_string();
        let text = text.to_string();
        self.request(|reply| Command::SendResponse {
            query_id,
            text,
            reply,
        })
        .await?
    }

    pub async fn send_report(&self, report: NewReport) -> Result<String, NodeError> {
        self.request(|reply| Command::SendReport { report, reply }).await?
    }

    pub async fn announce_presence(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::AnnouncePresence { reply }).await?
    }

    /// Run one scheduler tick now.
    pub async fn tick(&self) -> Result<TickOutcome, NodeError> {
        self.request(|reply| Command::Tick { reply }).await
    }

    /// Returns true if the scheduler was not already running.
    pub async fn start_scheduler(&self) -> Result<bool, NodeError> {
        self.request(|reply| Command::StartScheduler { reply }).await
    }

    pub async fn stop_scheduler(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::StopScheduler { reply }).await
    }

    /// Stop the scheduler and forget all protocol state.
    pub async fn reset(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Call `callback(query_id, text)` for every delivered response.
    pub fn on_response<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&str, &str) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(NodeEvent::Response { query_id, text }) => callback(&query_id, &text),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "response callback lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Hand a frame heard on the medium to the node. Never blocks; a full
    /// queue drops the frame like the air would.
    pub fn frame_received(&self, frame: Bytes) -> bool {
        self.tx.try_send(Command::Frame(frame)).is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

pub struct RelayNode {
    settings: NodeSettings,
    codec: FragmentCodec,
    tracker: ReassemblyTracker,
    scheduler: BroadcastScheduler,
    relay: RelayLayer,
    peers: PeerActivity,
    sender: Arc<dyn FrameSender>,
    backend: Arc<dyn RelayBackend>,
    clock: Arc<dyn Clock>,
    connectivity: watch::Receiver<bool>,
    watching: bool,
    ticker: Option<Interval>,
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl RelayNode {
    /// Subscribe to the medium and start the node task.
    pub fn spawn(
        settings: NodeSettings,
        sender: Arc<dyn FrameSender>,
        scanner: &dyn FrameScanner,
        backend: Arc<dyn RelayBackend>,
        connectivity: watch::Receiver<bool>,
        clock: Arc<dyn Clock>,
    ) -> Result<NodeHandle, NodeError> {
        let codec = FragmentCodec::new(settings.fragment_capacity)?;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let frame_tx = tx.clone();
        scanner.subscribe(Box::new(move |frame| {
            if frame_tx.try_send(Command::Frame(frame)).is_err() {
                tracing::trace!("node command queue full, dropping frame");
            }
        }))?;

        let relay = RelayLayer::new(RelaySettings {
            device_id: settings.device_id.clone(),
            dedup_capacity: settings.dedup_capacity,
            dedup_ttl: settings.dedup_ttl,
        });
        let node = RelayNode {
            codec,
            tracker: ReassemblyTracker::new(),
            scheduler: BroadcastScheduler::new(),
            relay,
            peers: PeerActivity::new(settings.liveness),
            sender,
            backend,
            clock,
            connectivity,
            watching: true,
            ticker: None,
            tx: tx.clone(),
            events: events.clone(),
            settings,
        };

        tracing::info!(
            device_id = %node.settings.device_id,
            capacity = node.codec.capacity(),
            frame_len = node.codec.frame_len(),
            "relay node starting"
        );
        tokio::spawn(node.run(rx));

        Ok(NodeHandle { tx, events })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let online = *self.connectivity.borrow_and_update();
        let actions = self.relay.set_online(online);
        let _ = self.apply(actions);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => self.handle(cmd),
                },

                changed = self.connectivity.changed(), if self.watching => {
                    if changed.is_err() {
                        // host dropped the signal; keep the last value
                        self.watching = false;
                        continue;
                    }
                    let online = *self.connectivity.borrow_and_update();
                    let actions = self.relay.set_online(online);
                    let _ = self.apply(actions);
                }

                _ = next_tick(&mut self.ticker) => {
                    self.tick();
                }
            }
        }

        tracing::info!(device_id = %self.settings.device_id, "relay node stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let now = self.clock.now();
        match cmd {
            Command::Frame(frame) => self.on_frame(frame),
            Command::SendQuery { query, reply } => {
                let (query_id, actions) = self.relay.send_query(query, now);
                let result = self.apply(actions);
                if result.is_err() {
                    self.relay.abandon_query(&query_id);
                }
                let _ = reply.send(result.map(|()| query_id));
            }
            Command::SendResponse {
                query_id,
                text,
                reply,
            } => {
                let actions = self.relay.send_response(&query_id, &text, now);
                let _ = reply.send(self.apply(actions));
            }
            Command::SendReport { report, reply } => {
                let (report_id, actions) = self.relay.send_report(report, now);
                let result = self.apply(actions);
                if result.is_err() {
                    self.relay.abandon_report(&report_id);
                }
                let _ = reply.send(result.map(|()| report_id));
            }
            Command::AnnouncePresence { reply } => {
                let actions = self.relay.announce_presence();
                let _ = reply.send(self.apply(actions));
            }
            Command::Tick { reply } => {
                let _ = reply.send(self.tick());
            }
            Command::StartScheduler { reply } => {
                let _ = reply.send(self.start_scheduler());
            }
            Command::StopScheduler { reply } => {
                self.scheduler.stop();
                self.ticker = None;
                let _ = reply.send(());
            }
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::QueryAnswered {
                query_id,
                route,
                result,
            } => {
                let actions = self.relay.query_answered(&query_id, route, result);
                let _ = self.apply(actions);
            }
            Command::ReportStored {
                report_id,
                route,
                result,
            } => {
                let actions = self.relay.report_stored(&report_id, route, result);
                let _ = self.apply(actions);
            }
            Command::PollResult { query_id, result } => {
                let actions = self.relay.poll_result(&query_id, result);
                let _ = self.apply(actions);
            }
            Command::Shutdown => {}
        }
    }

    fn on_frame(&mut self, frame: Bytes) {
        let fragment = match decode(&frame) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, len = frame.len(), "dropping undecodable frame");
                return;
            }
        };
        let now = self.clock.now();
        let id = fragment.id;

        match self.tracker.accept(fragment, now) {
            Accepted::Progress { received, total } => {
                self.peers.observe_message(id, now);
                tracing::trace!(message_id = id, received, total, "fragment stored");
            }
            Accepted::Complete(done) => {
                self.peers.observe_message(id, now);
                let actions = self
                    .relay
                    .handle_message(done.id, done.is_ack, done.payload, now);
                let _ = self.apply(actions);
            }
            Accepted::Ignored(reason) => {
                tracing::trace!(message_id = id, ?reason, "fragment ignored");
            }
        }
    }

    /// Carry out relay actions. Every action is attempted; the first
    /// broadcast failure is returned.
    fn apply(&mut self, actions: Vec<RelayAction>) -> Result<(), NodeError> {
        let mut first_err = None;
        for action in actions {
            let result = match action {
                RelayAction::Broadcast { message, opts } => self.broadcast(&message, opts),
                RelayAction::Rebroadcast {
                    message_id,
                    payload,
                    is_ack,
                } => self.rebroadcast(message_id, &payload, is_ack),
                RelayAction::SubmitQuery { request, route } => {
                    self.spawn_submit(request, route);
                    Ok(())
                }
                RelayAction::PollQuery { query_id } => {
                    self.spawn_poll(query_id);
                    Ok(())
                }
                RelayAction::StoreReport { report, route } => {
                    self.spawn_store(report, route);
                    Ok(())
                }
                RelayAction::Deliver { query_id, text } => {
                    self.emit(NodeEvent::Response { query_id, text });
                    Ok(())
                }
                RelayAction::QueryFailed { query_id, error } => {
                    self.emit(NodeEvent::QueryFailed { query_id, error });
                    Ok(())
                }
                RelayAction::ReportStored { report_id } => {
                    self.emit(NodeEvent::ReportStored { report_id });
                    Ok(())
                }
                RelayAction::ReportFailed { report_id, error } => {
                    self.emit(NodeEvent::ReportFailed { report_id, error });
                    Ok(())
                }
                RelayAction::Heartbeat { device } => {
                    self.peers.observe_presence(&device, self.clock.now());
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "relay action failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn broadcast(&mut self, message: &RelayMessage, opts: EncodeOptions) -> Result<(), NodeError> {
        let payload = message.to_bytes()?;
        let encoded = self.codec.encode(&payload, opts)?;
        self.tracker
            .register_outbound(encoded.id, encoded.is_ack, encoded.total(), self.clock.now());
        tracing::debug!(
            message_id = encoded.id,
            kind = message.kind_name(),
            frames = encoded.frames.len(),
            "queued broadcast"
        );
        self.scheduler.enqueue(encoded.id, encoded.frames);
        self.start_scheduler();
        Ok(())
    }

    fn rebroadcast(&mut self, message_id: MessageId, payload: &[u8], is_ack: bool) -> Result<(), NodeError> {
        let encoded = self.codec.encode(
            payload,
            EncodeOptions {
                is_ack,
                reuse_id: Some(message_id),
            },
        )?;
        self.scheduler.enqueue(encoded.id, encoded.frames);
        self.start_scheduler();
        Ok(())
    }

    fn start_scheduler(&mut self) -> bool {
        let started = self.scheduler.start();
        if self.ticker.is_none() {
            if let Some(period) = self.settings.tick_interval {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(interval);
            }
        }
        started
    }

    fn tick(&mut self) -> TickOutcome {
        let outcome = self.scheduler.tick(self.sender.as_ref());
        if matches!(outcome, TickOutcome::Idle | TickOutcome::Stopped) {
            self.ticker = None;
        }
        if let Some(max_age) = self.settings.reassembly_max_age {
            let evicted = self.tracker.evict_stale(self.clock.now(), max_age);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted stale partial messages");
            }
        }
        outcome
    }

    fn reset(&mut self) {
        // freeze ticks before clearing shared state
        self.ticker = None;
        self.scheduler.clear();
        self.tracker.reset();
        self.relay.reset();
        self.peers.reset();
        tracing::info!(device_id = %self.settings.device_id, "relay node reset");
    }

    fn status(&mut self) -> NodeStatus {
        let now = self.clock.now();
        NodeStatus {
            device_id: self.settings.device_id.clone(),
            online: self.relay.is_online(),
            active_peers: self.peers.active_count(now),
            active_devices: self.peers.active_devices(now),
            queued_messages: self.scheduler.len(),
            queued_frames: self.scheduler.pending_frames(),
            partial_messages: self.tracker.in_progress(),
            pending_queries: self.relay.pending_queries(),
            pending_reports: self.relay.pending_reports(),
            scheduler_running: self.scheduler.is_running(),
        }
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ── Backend calls ────────────────────────────────────────────────────────

    fn spawn_submit(&self, request: RelayQueryRequest, route: ReplyRoute) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        let timeout = self.settings.backend_timeout;
        tokio::spawn(async move {
            let query_id = request.query_id.clone();
            let result = with_timeout(timeout, backend.submit_query(request)).await;
            let _ = tx
                .send(Command::QueryAnswered {
                    query_id,
                    route,
                    result,
                })
                .await;
        });
    }

    fn spawn_poll(&self, query_id: String) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        let timeout = self.settings.backend_timeout;
        tokio::spawn(async move {
            let result = with_timeout(timeout, backend.check_query(&query_id)).await;
            let _ = tx.send(Command::PollResult { query_id, result }).await;
        });
    }

    fn spawn_store(&self, report: IncidentReport, route: ReplyRoute) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        let timeout = self.settings.backend_timeout;
        tokio::spawn(async move {
            let report_id = report.report_id.clone();
            let result = with_timeout(timeout, backend.store_report(report)).await;
            let _ = tx
                .send(Command::ReportStored {
                    report_id,
                    route,
                    result,
                })
                .await;
        });
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T, BackendError>>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(BackendError::Timeout(timeout).to_string()),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

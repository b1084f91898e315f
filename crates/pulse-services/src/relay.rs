//! Relay application layer: what to do with a reassembled message.
//!
//! `RelayLayer` is a pure state machine. Every input (a completed message,
//! a local request, a backend result, a connectivity change) returns the
//! list of [`RelayAction`]s the owner must carry out: queue a broadcast,
//! call the backend, or tell the application about an outcome. It never
//! touches the medium or the network itself, which keeps every rule here
//! testable by feeding inputs and inspecting the actions.
//!
//! Loop prevention works on query ids, not message ids:
//! - a gateway answers a query id once (`processed`)
//! - an offline device rebroadcasts each copy of a query once
//!   (`rebroadcasted`, keyed by query id and message id), and a response
//!   once under the separate `response-{id}` key. A query only travels
//!   under a second message id when its author re-asks it.
//! - a device never handles queries it authored (`own`)
//!
//! Reports follow the same rules under `report-{id}` keys.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use pulse_core::message::{derive_id, unix_millis};
use pulse_core::wire::{EncodeOptions, MessageId};
use pulse_core::{Location, QueryKind, RelayMessage};

use crate::backend::{CheckOutcome, IncidentReport, RelayQueryRequest};
use crate::ttl_cache::TtlCache;

/// Where the result of a backend call has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRoute {
    /// The request was made on this device.
    Local,
    /// The request arrived over the medium on `message_id`; the reply is
    /// broadcast back on the same id.
    Mesh { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    /// Encode `message` and queue it for broadcast.
    Broadcast {
        message: RelayMessage,
        opts: EncodeOptions,
    },
    /// Queue an already-encoded payload again under its original id.
    Rebroadcast {
        message_id: MessageId,
        payload: Bytes,
        is_ack: bool,
    },
    SubmitQuery {
        request: RelayQueryRequest,
        route: ReplyRoute,
    },
    PollQuery {
        query_id: String,
    },
    StoreReport {
        report: IncidentReport,
        route: ReplyRoute,
    },
    /// A pending local query has its answer.
    Deliver {
        query_id: String,
        text: String,
    },
    QueryFailed {
        query_id: String,
        error: String,
    },
    ReportStored {
        report_id: String,
    },
    ReportFailed {
        report_id: String,
        error: String,
    },
    /// Another device announced itself.
    Heartbeat {
        device: String,
    },
}

/// A query authored on this device.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuery {
    /// Derived from device, time and text when absent.
    pub query_id: Option<String>,
    pub text: String,
    pub kind: QueryKind,
    pub location: Option<Location>,
    pub extra: Option<serde_json::Value>,
}

impl NewQuery {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            query_id: None,
            text: text.into(),
            kind: QueryKind::Assistant,
            location: None,
            extra: None,
        }
    }
}

/// An incident report authored on this device.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub report_id: Option<String>,
    pub report_type: String,
    pub title: String,
    pub description: String,
    pub location: Option<Location>,
    pub severity: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub device_id: String,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl RelaySettings {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            dedup_capacity: 4096,
            dedup_ttl: Duration::from_secs(3600),
        }
    }
}

fn report_key(report_id: &str) -> String {
    format!("report-{}", report_id)
}

fn response_key(query_id: &str) -> String {
    format!("response-{}", query_id)
}

fn report_ack_key(report_id: &str) -> String {
    format!("report-ack-{}", report_id)
}

fn query_copy_key(query_id: &str, message_id: MessageId) -> String {
    format!("{}@{}", query_id, message_id)
}

#[derive(Debug)]
pub struct RelayLayer {
    device_id: String,
    online: bool,
    processed: TtlCache,
    rebroadcasted: TtlCache,
    own: TtlCache,
    /// query/report key → message id it arrived on, for replies.
    inbound_ids: TtlCache<MessageId>,
    pending_queries: HashMap<String, RelayQueryRequest>,
    pending_reports: HashMap<String, IncidentReport>,
    /// Queries with a status poll in flight.
    polling: HashSet<String>,
}

impl RelayLayer {
    pub fn new(settings: RelaySettings) -> Self {
        let cache = || TtlCache::new(settings.dedup_capacity, settings.dedup_ttl);
        Self {
            device_id: settings.device_id.clone(),
            online: false,
            processed: cache(),
            rebroadcasted: cache(),
            own: cache(),
            inbound_ids: TtlCache::new(settings.dedup_capacity, settings.dedup_ttl),
            pending_queries: HashMap::new(),
            pending_reports: HashMap::new(),
            polling: HashSet::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn pending_queries(&self) -> usize {
        self.pending_queries.len()
    }

    pub fn pending_reports(&self) -> usize {
        self.pending_reports.len()
    }

    pub fn is_pending(&self, query_id: &str) -> bool {
        self.pending_queries.contains_key(query_id)
    }

    /// Apply a connectivity change. Regaining connectivity reconciles.
    pub fn set_online(&mut self, online: bool) -> Vec<RelayAction> {
        let was_online = std::mem::replace(&mut self.online, online);
        if online == was_online {
            return Vec::new();
        }
        tracing::info!(online, "connectivity changed");
        if online {
            self.reconcile()
        } else {
            Vec::new()
        }
    }

    // ── Local requests ───────────────────────────────────────────────────────

    /// Returns the query id and what to do with it. Sending an id that is
    /// already pending re-asks it: offline the stored query goes out again
    /// under a fresh message id, online the backend is polled for it.
    pub fn send_query(&mut self, query: NewQuery, now: Instant) -> (String, Vec<RelayAction>) {
        let query_id = query
            .query_id
            .unwrap_or_else(|| derive_id(&self.device_id, unix_millis(), &query.text));
        if self.pending_queries.contains_key(&query_id) {
            let actions = self.reask(&query_id);
            return (query_id, actions);
        }

        let request = RelayQueryRequest {
            query_id: query_id.clone(),
            query_text: query.text.clone(),
            query_type: query.kind,
            user_location: query.location,
            original_device: self.device_id.clone(),
            relayed_by: self.device_id.clone(),
            sos_data: query.extra.clone(),
        };
        self.own.mark(query_id.clone(), now);
        self.pending_queries.insert(query_id.clone(), request.clone());

        let action = if self.online {
            tracing::info!(query_id = %query_id, kind = query.kind.as_str(), "sending query to backend");
            RelayAction::SubmitQuery {
                request,
                route: ReplyRoute::Local,
            }
        } else {
            tracing::info!(query_id = %query_id, kind = query.kind.as_str(), "offline, broadcasting query");
            RelayAction::Broadcast {
                message: RelayMessage::Query {
                    query_id: query_id.clone(),
                    text: query.text,
                    kind: query.kind,
                    location: query.location,
                    origin_device: self.device_id.clone(),
                    extra: query.extra,
                },
                opts: EncodeOptions::request(),
            }
        };
        (query_id, vec![action])
    }

    fn reask(&mut self, query_id: &str) -> Vec<RelayAction> {
        if self.online {
            if !self.polling.insert(query_id.to_string()) {
                return Vec::new();
            }
            return vec![RelayAction::PollQuery {
                query_id: query_id.to_string(),
            }];
        }
        let Some(request) = self.pending_queries.get(query_id) else {
            return Vec::new();
        };
        tracing::info!(query_id = %query_id, "re-asking pending query under a fresh message id");
        vec![RelayAction::Broadcast {
            message: RelayMessage::Query {
                query_id: request.query_id.clone(),
                text: request.query_text.clone(),
                kind: request.query_type,
                location: request.user_location,
                origin_device: request.original_device.clone(),
                extra: request.sos_data.clone(),
            },
            opts: EncodeOptions::request(),
        }]
    }

    /// Forget a query whose first send could not be carried out, so the
    /// same id can be sent again.
    pub fn abandon_query(&mut self, query_id: &str) {
        if self.pending_queries.remove(query_id).is_some() {
            self.own.remove(query_id);
            self.polling.remove(query_id);
            tracing::debug!(query_id = %query_id, "query abandoned");
        }
    }

    /// Forget a report whose first send could not be carried out.
    pub fn abandon_report(&mut self, report_id: &str) {
        if self.pending_reports.remove(report_id).is_some() {
            self.own.remove(&report_key(report_id));
            tracing::debug!(report_id = %report_id, "report abandoned");
        }
    }

    /// Answer a query heard on the medium. The reply reuses the id the
    /// query arrived on when it is still known.
    pub fn send_response(&mut self, query_id: &str, text: &str, now: Instant) -> Vec<RelayAction> {
        let opts = match self.inbound_ids.get(query_id, now) {
            Some(&id) => EncodeOptions::ack(id),
            None => EncodeOptions {
                is_ack: true,
                reuse_id: None,
            },
        };
        vec![RelayAction::Broadcast {
            message: RelayMessage::Response {
                query_id: query_id.to_string(),
                text: text.to_string(),
            },
            opts,
        }]
    }

    pub fn send_report(&mut self, report: NewReport, now: Instant) -> (String, Vec<RelayAction>) {
        let report_id = report.report_id.unwrap_or_else(|| {
            derive_id(
                &self.device_id,
                unix_millis(),
                &format!("{}{}", report.title, report.description),
            )
        });
        if self.pending_reports.contains_key(&report_id) {
            return (report_id, Vec::new());
        }

        let incident = IncidentReport {
            report_id: report_id.clone(),
            report_type: report.report_type.clone(),
            title: report.title.clone(),
            description: report.description.clone(),
            location: report.location,
            severity: report.severity,
            device_id: self.device_id.clone(),
        };
        self.own.mark(report_key(&report_id), now);
        self.pending_reports.insert(report_id.clone(), incident.clone());

        let action = if self.online {
            RelayAction::StoreReport {
                report: incident,
                route: ReplyRoute::Local,
            }
        } else {
            tracing::info!(report_id = %report_id, "offline, broadcasting report");
            RelayAction::Broadcast {
                message: RelayMessage::Report {
                    report_id: report_id.clone(),
                    report_type: report.report_type,
                    title: report.title,
                    description: report.description,
                    location: report.location,
                    severity: report.severity,
                    origin_device: self.device_id.clone(),
                },
                opts: EncodeOptions::request(),
            }
        };
        (report_id, vec![action])
    }

    pub fn announce_presence(&self) -> Vec<RelayAction> {
        vec![RelayAction::Broadcast {
            message: RelayMessage::Presence {
                device: self.device_id.clone(),
            },
            opts: EncodeOptions::request(),
        }]
    }

    // ── Incoming messages ────────────────────────────────────────────────────

    /// Handle a message the reassembly tracker just completed.
    pub fn handle_message(
        &mut self,
        message_id: MessageId,
        is_ack: bool,
        payload: Bytes,
        now: Instant,
    ) -> Vec<RelayAction> {
        let message = match RelayMessage::from_bytes(&payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(message_id, error = %e, "dropping undecodable payload");
                return Vec::new();
            }
        };
        tracing::debug!(message_id, is_ack, kind = message.kind_name(), "message received");

        match message {
            RelayMessage::Query {
                query_id,
                text,
                kind,
                location,
                origin_device,
                extra,
            } => {
                let copy_key = query_copy_key(&query_id, message_id);
                if self.own.contains(&query_id, now)
                    || self.processed.contains(&query_id, now)
                    || self.rebroadcasted.contains(&copy_key, now)
                {
                    tracing::debug!(query_id = %query_id, "query already handled, dropping");
                    return Vec::new();
                }
                // replies follow the latest copy
                self.inbound_ids.remove(&query_id);
                self.inbound_ids.insert(query_id.clone(), message_id, now);

                if self.online {
                    self.processed.mark(query_id.clone(), now);
                    tracing::info!(query_id = %query_id, origin = %origin_device, "relaying query to backend");
                    vec![RelayAction::SubmitQuery {
                        request: RelayQueryRequest {
                            query_id,
                            query_text: text,
                            query_type: kind,
                            user_location: location,
                            original_device: origin_device,
                            relayed_by: self.device_id.clone(),
                            sos_data: extra,
                        },
                        route: ReplyRoute::Mesh { message_id },
                    }]
                } else {
                    self.rebroadcasted.mark(copy_key, now);
                    tracing::info!(query_id = %query_id, message_id, "offline, rebroadcasting query once");
                    vec![RelayAction::Rebroadcast {
                        message_id,
                        payload,
                        is_ack,
                    }]
                }
            }

            RelayMessage::Response { query_id, text } => {
                if self.pending_queries.remove(&query_id).is_some() {
                    self.polling.remove(&query_id);
                    // the answer reached its author; copies need not travel further
                    self.rebroadcasted.mark(response_key(&query_id), now);
                    tracing::info!(query_id = %query_id, "response delivered");
                    return vec![RelayAction::Deliver { query_id, text }];
                }
                if !self.online && self.rebroadcasted.mark(response_key(&query_id), now) {
                    tracing::info!(query_id = %query_id, "offline, rebroadcasting response once");
                    return vec![RelayAction::Rebroadcast {
                        message_id,
                        payload,
                        is_ack,
                    }];
                }
                Vec::new()
            }

            RelayMessage::Report {
                report_id,
                report_type,
                title,
                description,
                location,
                severity,
                origin_device,
            } => {
                let key = report_key(&report_id);
                if self.own.contains(&key, now) {
                    return Vec::new();
                }
                if self.online {
                    if !self.processed.mark(key.clone(), now) {
                        return Vec::new();
                    }
                    self.inbound_ids.insert(key, message_id, now);
                    tracing::info!(report_id = %report_id, origin = %origin_device, "storing relayed report");
                    vec![RelayAction::StoreReport {
                        report: IncidentReport {
                            report_id,
                            report_type,
                            title,
                            description,
                            location,
                            severity,
                            device_id: origin_device,
                        },
                        route: ReplyRoute::Mesh { message_id },
                    }]
                } else if !self.processed.contains(&key, now) && self.rebroadcasted.mark(key, now) {
                    vec![RelayAction::Rebroadcast {
                        message_id,
                        payload,
                        is_ack,
                    }]
                } else {
                    Vec::new()
                }
            }

            RelayMessage::ReportAck { report_id } => {
                if self.pending_reports.remove(&report_id).is_some() {
                    tracing::info!(report_id = %report_id, "report acknowledged by gateway");
                    return vec![RelayAction::ReportStored { report_id }];
                }
                if !self.online && self.rebroadcasted.mark(report_ack_key(&report_id), now) {
                    return vec![RelayAction::Rebroadcast {
                        message_id,
                        payload,
                        is_ack,
                    }];
                }
                Vec::new()
            }

            RelayMessage::Presence { device } => {
                if device == self.device_id {
                    return Vec::new();
                }
                vec![RelayAction::Heartbeat { device }]
            }
        }
    }

    // ── Backend results ──────────────────────────────────────────────────────

    pub fn query_answered(
        &mut self,
        query_id: &str,
        route: ReplyRoute,
        result: Result<String, String>,
    ) -> Vec<RelayAction> {
        match (route, result) {
            (ReplyRoute::Mesh { message_id }, Ok(text)) => {
                tracing::info!(query_id = %query_id, "broadcasting backend answer");
                vec![RelayAction::Broadcast {
                    message: RelayMessage::Response {
                        query_id: query_id.to_string(),
                        text,
                    },
                    opts: EncodeOptions::ack(message_id),
                }]
            }
            (ReplyRoute::Mesh { .. }, Err(error)) => {
                tracing::warn!(query_id = %query_id, error = %error, "relayed query failed at backend");
                self.processed.remove(query_id);
                Vec::new()
            }
            (ReplyRoute::Local, Ok(text)) => {
                if self.pending_queries.remove(query_id).is_none() {
                    return Vec::new();
                }
                self.polling.remove(query_id);
                vec![RelayAction::Deliver {
                    query_id: query_id.to_string(),
                    text,
                }]
            }
            (ReplyRoute::Local, Err(error)) => {
                if self.pending_queries.remove(query_id).is_none() {
                    return Vec::new();
                }
                self.polling.remove(query_id);
                tracing::warn!(query_id = %query_id, error = %error, "query failed");
                vec![RelayAction::QueryFailed {
                    query_id: query_id.to_string(),
                    error,
                }]
            }
        }
    }

    pub fn report_stored(
        &mut self,
        report_id: &str,
        route: ReplyRoute,
        result: Result<(), String>,
    ) -> Vec<RelayAction> {
        match (route, result) {
            (ReplyRoute::Mesh { message_id }, Ok(())) => vec![RelayAction::Broadcast {
                message: RelayMessage::ReportAck {
                    report_id: report_id.to_string(),
                },
                opts: EncodeOptions::ack(message_id),
            }],
            (ReplyRoute::Mesh { .. }, Err(error)) => {
                tracing::warn!(report_id = %report_id, error = %error, "relayed report failed at backend");
                self.processed.remove(&report_key(report_id));
                Vec::new()
            }
            (ReplyRoute::Local, Ok(())) => {
                if self.pending_reports.remove(report_id).is_none() {
                    return Vec::new();
                }
                vec![RelayAction::ReportStored {
                    report_id: report_id.to_string(),
                }]
            }
            (ReplyRoute::Local, Err(error)) => {
                if self.pending_reports.remove(report_id).is_none() {
                    return Vec::new();
                }
                tracing::warn!(report_id = %report_id, error = %error, "report failed");
                vec![RelayAction::ReportFailed {
                    report_id: report_id.to_string(),
                    error,
                }]
            }
        }
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    /// Poll the backend for every pending query and resubmit every pending
    /// report. Queries with a poll already in flight are skipped.
    pub fn reconcile(&mut self) -> Vec<RelayAction> {
        let mut query_ids: Vec<String> = self
            .pending_queries
            .keys()
            .filter(|id| !self.polling.contains(*id))
            .cloned()
            .collect();
        query_ids.sort();

        let mut reports: Vec<IncidentReport> = self.pending_reports.values().cloned().collect();
        reports.sort_by(|a, b| a.report_id.cmp(&b.report_id));

        if !query_ids.is_empty() || !reports.is_empty() {
            tracing::info!(
                queries = query_ids.len(),
                reports = reports.len(),
                "reconciling pending work with backend"
            );
        }

        let mut actions = Vec::with_capacity(query_ids.len() + reports.len());
        for query_id in query_ids {
            self.polling.insert(query_id.clone());
            actions.push(RelayAction::PollQuery { query_id });
        }
        for report in reports {
            actions.push(RelayAction::StoreReport {
                report,
                route: ReplyRoute::Local,
            });
        }
        actions
    }

    pub fn poll_result(
        &mut self,
        query_id: &str,
        result: Result<CheckOutcome, String>,
    ) -> Vec<RelayAction> {
        self.polling.remove(query_id);
        if !self.pending_queries.contains_key(query_id) {
            return Vec::new();
        }

        match result {
            Ok(CheckOutcome::Completed(text)) => {
                self.pending_queries.remove(query_id);
                tracing::info!(query_id = %query_id, "response recovered from backend");
                vec![RelayAction::Deliver {
                    query_id: query_id.to_string(),
                    text,
                }]
            }
            Ok(CheckOutcome::Failed(error)) => {
                self.pending_queries.remove(query_id);
                vec![RelayAction::QueryFailed {
                    query_id: query_id.to_string(),
                    error,
                }]
            }
            Ok(CheckOutcome::NotFound) if self.online => {
                let Some(request) = self.pending_queries.get(query_id) else {
                    return Vec::new();
                };
                tracing::info!(query_id = %query_id, "backend never saw query, submitting directly");
                vec![RelayAction::SubmitQuery {
                    request: request.clone(),
                    route: ReplyRoute::Local,
                }]
            }
            Ok(_) => Vec::new(),
            Err(error) => {
                tracing::debug!(query_id = %query_id, error = %error, "status poll failed");
                Vec::new()
            }
        }
    }

    /// Forget every id and pending request.
    pub fn reset(&mut self) {
        self.processed.clear();
        self.rebroadcasted.clear();
        self.own.clear();
        self.inbound_ids.clear();
        self.pending_queries.clear();
        self.pending_reports.clear();
        self.polling.clear();
    }
}

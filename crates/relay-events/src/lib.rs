//! Event fanout for lifecycle and knowledge-mutation events.
//!
//! The hub keeps a process-local subscriber set and broadcasts each event
//! at most once to the subscribers of a logical room. There is no replay
//! and no durability: an observer that is disconnected misses events
//! emitted while it was away. The hub is constructed once and injected
//! into the services that emit; there is no ambient global emitter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

mod notify;

pub use notify::WebhookNotifier;


/// Room every supervisor-facing event is broadcast to by default.
pub const DEFAULT_EVENT_ROOM: &str = "supervisor";

pub const WS_ERROR_CODE_INVALID_JSON: &str = "invalid_json";
pub const WS_ERROR_CODE_UNSUPPORTED_KIND: &str = "unsupported_kind";

/// Payload of `new_help_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHelpRequestPayload {
    pub request_id: String,
    pub question: String,
    pub customer_phone: String,
    pub timestamp: u64,
}

/// Payload of `request_resolved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResolvedPayload {
    pub request_id: String,
    pub status: String,
    pub kb_created: bool,
    pub kb_entry_id: String,
}

/// Payload of `request_unresolved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestUnresolvedPayload {
    pub request_id: String,
    pub reason: String,
}

/// Knowledge-mutation kind carried by `kb_updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbAction {
    Added,
    Updated,
    Deleted,
}

/// Payload of `kb_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbUpdatedPayload {
    pub action: KbAction,
    pub kb_entry_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

/// Payload of `request_timeout_warning`. Advisory only; the same request
/// may warn on multiple consecutive sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTimeoutWarningPayload {
    pub request_id: String,
    pub question: String,
    pub time_remaining: String,
}

/// The five event kinds broadcast to subscribed observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum FanoutEvent {
    NewHelpRequest(NewHelpRequestPayload),
    RequestResolved(RequestResolvedPayload),
    RequestUnresolved(RequestUnresolvedPayload),
    KbUpdated(KbUpdatedPayload),
    RequestTimeoutWarning(RequestTimeoutWarningPayload),
}

impl FanoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewHelpRequest(_) => "new_help_request",
            Self::RequestResolved(_) => "request_resolved",
            Self::RequestUnresolved(_) => "request_unresolved",
            Self::KbUpdated(_) => "kb_updated",
            Self::RequestTimeoutWarning(_) => "request_timeout_warning",
        }
    }
}

struct Subscriber {
    rooms: HashSet<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Process-local broadcast hub for the supervisor event channel.
#[derive(Default)]
pub struct FanoutHub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    sequence: AtomicU64,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a connection and returns its id plus the frame stream.
    /// The connection observes nothing until it subscribes to a room.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let subscriber_id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers();
        subscribers.insert(
            subscriber_id,
            Subscriber {
                rooms: HashSet::new(),
                tx,
            },
        );
        (subscriber_id, rx)
    }

    pub fn subscribe(&self, subscriber_id: u64, room: &str) -> bool {
        let mut subscribers = self.subscribers();
        match subscribers.get_mut(&subscriber_id) {
            Some(subscriber) => {
                subscriber.rooms.insert(room.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, subscriber_id: u64, room: &str) -> bool {
        let mut subscribers = self.subscribers();
        match subscribers.get_mut(&subscriber_id) {
            Some(subscriber) => subscriber.rooms.remove(room),
            None => false,
        }
    }

    /// Removes a connection; its pending frames are dropped.
    pub fn disconnect(&self, subscriber_id: u64) {
        let mut subscribers = self.subscribers();
        subscribers.remove(&subscriber_id);
    }

    pub fn connected_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Broadcasts `event` to every subscriber of `room`, at most once per
    /// subscriber. Dead connections are pruned on the way. Returns the
    /// number of subscribers the frame was delivered to.
    pub fn emit(&self, room: &str, event: &FanoutEvent) -> usize {
        let frame = match serde_json::to_string(&event_frame(event)) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(event = event.name(), %error, "failed to serialize fanout frame");
                return 0;
            }
        };

        let mut subscribers = self.subscribers();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (subscriber_id, subscriber) in subscribers.iter() {
            if !subscriber.rooms.contains(room) {
                continue;
            }
            if subscriber.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*subscriber_id);
            }
        }
        for subscriber_id in dead {
            subscribers.remove(&subscriber_id);
        }
        tracing::debug!(
            event = event.name(),
            room = room,
            delivered = delivered,
            "fanout event emitted"
        );
        delivered
    }

    /// Broadcasts to the default supervisor room.
    pub fn emit_default(&self, event: &FanoutEvent) -> usize {
        self.emit(DEFAULT_EVENT_ROOM, event)
    }
}

/// Inbound frames understood on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsClientFrame {
    Subscribe { room: String },
    Unsubscribe { room: String },
    Ping,
}

#[derive(Debug, Deserialize)]
struct RawClientFrame {
    kind: String,
    #[serde(default)]
    payload: RawClientPayload,
}

#[derive(Debug, Default, Deserialize)]
struct RawClientPayload {
    #[serde(default)]
    room: Option<String>,
}

/// Parses an inbound websocket text frame.
pub fn parse_ws_client_frame(raw: &str) -> Result<WsClientFrame> {
    let frame: RawClientFrame = serde_json::from_str(raw)
        .map_err(|error| anyhow::Error::new(error).context("invalid event channel frame"))?;
    let room = frame
        .payload
        .room
        .as_deref()
        .map(str::trim)
        .filter(|room| !room.is_empty())
        .unwrap_or(DEFAULT_EVENT_ROOM)
        .to_string();
    match frame.kind.as_str() {
        "subscribe" => Ok(WsClientFrame::Subscribe { room }),
        "unsubscribe" => Ok(WsClientFrame::Unsubscribe { room }),
        "ping" => Ok(WsClientFrame::Ping),
        other => bail!(
            "unsupported event channel frame kind '{}'; supported kinds are subscribe, unsubscribe, ping",
            other
        ),
    }
}

/// Maps a frame-parse failure to the error code reported back to the
/// client: malformed JSON vs. a well-formed frame of an unsupported kind.
pub fn client_frame_error_code(error: &anyhow::Error) -> &'static str {
    if error.root_cause().downcast_ref::<serde_json::Error>().is_some() {
        WS_ERROR_CODE_INVALID_JSON
    } else {
        WS_ERROR_CODE_UNSUPPORTED_KIND
    }
}

/// Serializes an event into a broadcast frame.
pub fn event_frame(event: &FanoutEvent) -> Value {
    let mut frame = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    frame["kind"] = Value::String("event".to_string());
    frame
}

pub fn connection_info_frame(subscriber_id: u64, connected_clients: usize, now_unix_ms: u64) -> Value {
    json!({
        "kind": "connection_info",
        "payload": {
            "subscriberId": subscriber_id,
            "connectedClients": connected_clients,
            "serverUnixMs": now_unix_ms,
        },
    })
}

pub fn subscribed_frame(room: &str) -> Value {
    json!({
        "kind": "subscribed",
        "payload": { "room": room, "message": "Successfully subscribed to updates" },
    })
}

pub fn unsubscribed_frame(room: &str) -> Value {
    json!({
        "kind": "unsubscribed",
        "payload": { "room": room },
    })
}

pub fn pong_frame(now_unix_ms: u64) -> Value {
    json!({
        "kind": "pong",
        "payload": { "timestamp": now_unix_ms },
    })
}

pub fn error_frame(code: &str, message: &str) -> Value {
    json!({
        "kind": "error",
        "payload": { "code": code, "message": message },
    })
}

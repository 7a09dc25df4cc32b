#![forbid(unsafe_code)]

// Matchmaking protocol - event types exchanged with the server

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Inbound event kinds this client understands. Anything else decodes to
/// [`InboundEvent::Unknown`].
const KNOWN_KINDS: &[&str] = &[
    "connect",
    "disconnect",
    "connect_error",
    "waiting_for_peer",
    "waiting-for-peer",
    "match_ready",
    "match-ready",
    "peer_disconnected",
    "peer-disconnected",
    "peer_skipped",
    "peer-skipped",
    "signal",
    "debug_info",
    "debug-info",
];

/// Session description carried by an offer or answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Signal payload, used in both directions.
///
/// Kept loosely typed: the candidate is opaque JSON and neither field is
/// required, so unexpected shapes reach the signaling simulator instead of
/// failing to decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
}

/// Kind of a recognised signal message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalPayload {
    /// Classify the payload by shape. `None` for anything that is neither a
    /// known description type nor a candidate.
    pub fn kind(&self) -> Option<SignalKind> {
        if let Some(description) = &self.description {
            return match description.kind.as_str() {
                "offer" => Some(SignalKind::Offer),
                "answer" => Some(SignalKind::Answer),
                _ => None,
            };
        }
        self.candidate.as_ref().map(|_| SignalKind::Candidate)
    }
}

/// Server-to-client events
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "connect_error")]
    ConnectError {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "waiting_for_peer", alias = "waiting-for-peer")]
    WaitingForPeer,
    #[serde(rename = "match_ready", alias = "match-ready", rename_all = "camelCase")]
    MatchReady {
        room_id: String,
        #[serde(default)]
        is_initiator: bool,
        #[serde(default)]
        peer_id: Option<String>,
    },
    #[serde(rename = "peer_disconnected", alias = "peer-disconnected")]
    PeerDisconnected,
    #[serde(rename = "peer_skipped", alias = "peer-skipped")]
    PeerSkipped,
    #[serde(rename = "signal")]
    Signal(SignalPayload),
    #[serde(rename = "debug_info", alias = "debug-info")]
    DebugInfo {
        #[serde(default)]
        state: serde_json::Value,
    },
    /// An event kind this client does not know about.
    #[serde(skip)]
    Unknown { kind: String },
    /// A known event kind whose payload did not decode.
    #[serde(skip)]
    Malformed { kind: String, reason: String },
}

impl InboundEvent {
    /// Decode one `{"type": <kind>, ...payload}` frame.
    ///
    /// Never fails: frames without a kind or with an invalid payload become
    /// [`InboundEvent::Malformed`], unrecognised kinds become
    /// [`InboundEvent::Unknown`].
    pub fn decode(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return InboundEvent::Malformed {
                    kind: String::new(),
                    reason: e.to_string(),
                }
            }
        };

        let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
            return InboundEvent::Malformed {
                kind: String::new(),
                reason: "missing event type".to_string(),
            };
        };

        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return InboundEvent::Unknown { kind };
        }

        match serde_json::from_value::<InboundEvent>(value) {
            Ok(event) => event,
            Err(e) => InboundEvent::Malformed {
                kind,
                reason: e.to_string(),
            },
        }
    }

    /// Wire name of this event.
    pub fn kind(&self) -> &str {
        match self {
            InboundEvent::Connect => "connect",
            InboundEvent::Disconnect => "disconnect",
            InboundEvent::ConnectError { .. } => "connect_error",
            InboundEvent::WaitingForPeer => "waiting_for_peer",
            InboundEvent::MatchReady { .. } => "match_ready",
            InboundEvent::PeerDisconnected => "peer_disconnected",
            InboundEvent::PeerSkipped => "peer_skipped",
            InboundEvent::Signal(_) => "signal",
            InboundEvent::DebugInfo { .. } => "debug_info",
            InboundEvent::Unknown { kind } => kind,
            InboundEvent::Malformed { kind, .. } => kind,
        }
    }
}

/// Client-to-server events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "start-search")]
    StartSearch,
    #[serde(rename = "stop-search")]
    StopSearch,
    #[serde(rename = "skip")]
    Skip,
    /// Acknowledge a match
    #[serde(rename = "match-ready", rename_all = "camelCase")]
    MatchReady { match_id: String },
    #[serde(rename = "signal")]
    Signal(SignalPayload),
    /// Ask the server to report its view of this client
    #[serde(rename = "debug-state")]
    DebugState,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::StartSearch => "start-search",
            OutboundEvent::StopSearch => "stop-search",
            OutboundEvent::Skip => "skip",
            OutboundEvent::MatchReady { .. } => "match-ready",
            OutboundEvent::Signal(_) => "signal",
            OutboundEvent::DebugState => "debug-state",
        }
    }
}

/// An inbound event as observed by one client.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub event: InboundEvent,
    pub observed_at: Instant,
}

impl ProtocolEvent {
    pub fn observed(event: InboundEvent) -> Self {
        Self {
            event,
            observed_at: Instant::now(),
        }
    }
}

#![forbid(unsafe_code)]

// Signaling simulator - placeholder offer/answer/candidate exchange

use crate::config::SignalingDelays;
use crate::error::Failure;
use crate::protocol::{SessionDescription, SignalKind, SignalPayload};
use std::time::Duration;

const PLACEHOLDER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
const PLACEHOLDER_CANDIDATE: &str = "candidate:0 1 UDP 2122252543 127.0.0.1 9 typ host";

/// A matched client's side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Initiator,
    #[default]
    Responder,
}

impl Role {
    pub fn from_initiator(is_initiator: bool) -> Self {
        if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// What to do about one inbound signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalResponse {
    /// Send `payload` after `delay`
    Reply {
        received: SignalKind,
        delay: Duration,
        payload: SignalPayload,
    },
    /// Recognised; nothing to send
    Done { received: SignalKind },
    /// Neither a known description nor a candidate
    Unrecognised,
}

/// Stateless reply policy.
///
/// The initiator offers, the responder answers, the initiator opens the
/// candidate exchange and the responder returns one candidate. The initiator
/// never replies to candidates so every exchange is finite.
#[derive(Debug, Clone, Default)]
pub struct SignalingSimulator {
    delays: SignalingDelays,
}

impl SignalingSimulator {
    pub fn new(delays: SignalingDelays) -> Self {
        Self { delays }
    }

    /// The initiator's first offer for `room_id`.
    pub fn opening_offer(&self, role: Role, room_id: &str) -> Option<(Duration, SignalPayload)> {
        match role {
            Role::Initiator => Some((self.delays.offer, description("offer", room_id))),
            Role::Responder => None,
        }
    }

    pub fn respond(
        &self,
        role: Role,
        room_id: &str,
        payload: &SignalPayload,
    ) -> Result<SignalResponse, Failure> {
        let Some(received) = payload.kind() else {
            return Ok(SignalResponse::Unrecognised);
        };

        let response = match (received, role) {
            (SignalKind::Offer, Role::Responder) => SignalResponse::Reply {
                received,
                delay: self.delays.answer,
                payload: description("answer", room_id),
            },
            (SignalKind::Answer, Role::Initiator) => SignalResponse::Reply {
                received,
                delay: self.delays.candidate,
                payload: candidate(room_id),
            },
            (SignalKind::Candidate, Role::Responder) => SignalResponse::Reply {
                received,
                delay: self.delays.candidate,
                payload: candidate(room_id),
            },
            (SignalKind::Candidate, Role::Initiator) => SignalResponse::Done { received },
            (SignalKind::Offer, Role::Initiator) => {
                return Err(Failure::Signaling("initiator received an offer".into()))
            }
            (SignalKind::Answer, Role::Responder) => {
                return Err(Failure::Signaling("responder received an answer".into()))
            }
        };
        Ok(response)
    }
}

fn description(kind: &str, room_id: &str) -> SignalPayload {
    SignalPayload {
        room_id: Some(room_id.to_string()),
        description: Some(SessionDescription {
            kind: kind.to_string(),
            sdp: PLACEHOLDER_SDP.to_string(),
        }),
        candidate: None,
    }
}

fn candidate(room_id: &str) -> SignalPayload {
    SignalPayload {
        room_id: Some(room_id.to_string()),
        description: None,
        candidate: Some(serde_json::json!({
            "candidate": PLACEHOLDER_CANDIDATE,
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })),
    }
}

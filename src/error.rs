#![forbid(unsafe_code)]

// Error types - transport errors and the per-client failure taxonomy

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`crate::transport::Connector`] or an open connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

/// Failure category, used as the stats key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    ConnectError,
    ConnectTimeout,
    WaitingTimeout,
    MatchTimeout,
    SignalingError,
    UnexpectedDisconnect,
    LifecycleError,
}

impl FailureKind {
    pub const ALL: [FailureKind; 7] = [
        FailureKind::ConnectError,
        FailureKind::ConnectTimeout,
        FailureKind::WaitingTimeout,
        FailureKind::MatchTimeout,
        FailureKind::SignalingError,
        FailureKind::UnexpectedDisconnect,
        FailureKind::LifecycleError,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FailureKind::ConnectError => "Connection errors",
            FailureKind::ConnectTimeout => "Connect timeouts",
            FailureKind::WaitingTimeout => "Waiting timeouts",
            FailureKind::MatchTimeout => "Match timeouts",
            FailureKind::SignalingError => "Signaling errors",
            FailureKind::UnexpectedDisconnect => "Unexpected disconnects",
            FailureKind::LifecycleError => "Lifecycle errors",
        }
    }
}

/// A classified failure observed by one simulated client.
///
/// None of these are fatal to the run: the client records the failure and
/// either retries or carries on with its lifecycle.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no waiting_for_peer within {0:?} of start-search")]
    WaitingTimeout(Duration),

    #[error("search not resolved within {0:?}")]
    MatchTimeout(Duration),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("unexpected disconnect")]
    UnexpectedDisconnect,

    #[error("lifecycle aborted: {0}")]
    Lifecycle(String),
}

impl Failure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Failure::Connect(_) => FailureKind::ConnectError,
            Failure::ConnectTimeout(_) => FailureKind::ConnectTimeout,
            Failure::WaitingTimeout(_) => FailureKind::WaitingTimeout,
            Failure::MatchTimeout(_) => FailureKind::MatchTimeout,
            Failure::Signaling(_) => FailureKind::SignalingError,
            Failure::UnexpectedDisconnect => FailureKind::UnexpectedDisconnect,
            Failure::Lifecycle(_) => FailureKind::LifecycleError,
        }
    }
}

#![forbid(unsafe_code)]

// matchload library - concurrent load and diagnostic harness for matchmaking servers

pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod stats;
pub mod transport;

pub use client::{ClientState, ClientSummary, SimulatedClient};
pub use config::{BackoffPolicy, ClientConfig, PeerLossPolicy, RampUp, RunConfig, SignalingDelays};
pub use error::{Failure, FailureKind, TransportError};
pub use orchestrator::Orchestrator;
pub use stats::{FinalReport, Stats, StatsAggregator, StatsHandle};

#![forbid(unsafe_code)]

// Run configuration - population, timing and retry policies

use std::time::Duration;

/// Capped exponential backoff.
///
/// `delay_for(n)` is the wait before retry `n + 1`: `base_delay *
/// multiplier^n`, capped at `max_delay`, optionally spread by up to `jitter`
/// (a fraction of the delay) in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl BackoffPolicy {
    /// A policy that retries at a fixed interval.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());

        let spread = if self.jitter > 0.0 {
            let unit: f64 = rand::random::<f64>() * 2.0 - 1.0;
            capped * self.jitter.min(1.0) * unit
        } else {
            0.0
        };

        Duration::from_nanos(((capped + spread).max(0.0) * 1e9).round() as u64)
    }
}

/// What a client does after its peer disconnects or skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerLossPolicy {
    /// Start a new search straight away
    #[default]
    Research,
    /// End the client's session
    Disconnect,
}

/// How clients are introduced into the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampUp {
    /// Admit clients one at a time, `delay` apart
    Staggered { delay: Duration },
    /// Admit as many clients as the concurrency cap allows at once
    Simultaneous,
}

impl Default for RampUp {
    fn default() -> Self {
        RampUp::Staggered {
            delay: Duration::from_millis(500),
        }
    }
}

/// Placeholder signaling delays
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingDelays {
    /// Initiator's wait between match and its opening offer
    pub offer: Duration,
    pub answer: Duration,
    pub candidate: Duration,
}

impl Default for SignalingDelays {
    fn default() -> Self {
        Self {
            offer: Duration::from_millis(500),
            answer: Duration::from_millis(500),
            candidate: Duration::from_millis(100),
        }
    }
}

/// Per-client behaviour
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// How long each client stays in the run
    pub run_duration: Duration,
    pub connect_timeout: Duration,
    pub connect_backoff: BackoffPolicy,
    /// Reconnects after the transport drops mid-run
    pub reconnect: BackoffPolicy,
    /// Limit on waiting for `waiting_for_peer` after `start-search`
    pub waiting_timeout: Duration,
    /// Limit on a search resolving into a match
    pub match_timeout: Duration,
    /// Limit on a `debug_info` reply to a `debug-state` probe
    pub debug_timeout: Duration,
    /// Pause before re-issuing `start-search` after a waiting timeout
    pub search_retry_delay: Duration,
    /// How long a client stays matched before skipping
    pub match_hold: Duration,
    pub peer_loss: PeerLossPolicy,
    pub signaling: SignalingDelays,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3001".to_string(),
            run_duration: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(8),
            connect_backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                multiplier: 2.0,
                max_delay: Duration::from_secs(5),
                jitter: 0.1,
            },
            reconnect: BackoffPolicy::fixed(3, Duration::from_secs(5)),
            waiting_timeout: Duration::from_secs(5),
            match_timeout: Duration::from_secs(15),
            debug_timeout: Duration::from_secs(3),
            search_retry_delay: Duration::from_secs(2),
            match_hold: Duration::from_secs(8),
            peer_loss: PeerLossPolicy::default(),
            signaling: SignalingDelays::default(),
        }
    }
}

/// Whole-run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub population: usize,
    /// Maximum number of lifecycles running at once; `None` runs everyone
    pub concurrency: Option<usize>,
    pub ramp_up: RampUp,
    /// Overall run limit, measured from the start of the run
    pub deadline: Option<Duration>,
    /// Time clients get to stop on their own after cancellation or deadline
    pub grace_period: Duration,
    /// Progress log cadence; zero disables the progress reporter
    pub report_interval: Duration,
    /// Probe the endpoint once before admitting any client
    pub preflight: bool,
    pub client: ClientConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            population: 10,
            concurrency: None,
            ramp_up: RampUp::default(),
            deadline: None,
            grace_period: Duration::from_secs(10),
            report_interval: Duration::from_secs(10),
            preflight: true,
            client: ClientConfig::default(),
        }
    }
}

impl RunConfig {
    /// Effective concurrency cap, never zero.
    pub fn concurrency_cap(&self) -> usize {
        self.concurrency
            .unwrap_or(self.population)
            .min(self.population)
            .max(1)
    }
}

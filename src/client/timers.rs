#![forbid(unsafe_code)]

// Client timers - the pending deadlines of one simulated client

use crate::protocol::OutboundEvent;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Timer {
    WaitingTimeout,
    MatchTimeout,
    /// Outstanding `debug-state` probe
    DebugProbe,
    MatchHold,
    SearchRetry,
    /// Delayed signaling send
    Send(OutboundEvent),
}

/// Pending timers, fired in deadline order (insertion order on ties).
#[derive(Debug, Default)]
pub(crate) struct Timers {
    pending: Vec<(Instant, Timer)>,
}

impl Timers {
    pub fn arm(&mut self, after: Duration, timer: Timer) {
        self.pending.push((Instant::now() + after, timer));
    }

    /// Arm `timer`, replacing any pending copy of it.
    pub fn arm_unique(&mut self, after: Duration, timer: Timer) {
        self.pending.retain(|(_, t)| *t != timer);
        self.arm(after, timer);
    }

    pub fn disarm(&mut self, pred: impl Fn(&Timer) -> bool) {
        self.pending.retain(|(_, t)| !pred(t));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(at, _)| *at).min()
    }

    /// Remove and return the earliest timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        let mut earliest: Option<(usize, Instant)> = None;
        for (idx, (at, _)) in self.pending.iter().enumerate() {
            if *at <= now && earliest.map_or(true, |(_, best)| *at < best) {
                earliest = Some((idx, *at));
            }
        }
        earliest.map(|(idx, _)| self.pending.remove(idx).1)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

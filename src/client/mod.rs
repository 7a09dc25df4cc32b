#![forbid(unsafe_code)]

// Simulated client - one matchmaking participant driven through its lifecycle

pub mod signaling;
pub(crate) mod timers;

pub use signaling::{Role, SignalResponse, SignalingSimulator};

use crate::config::{ClientConfig, PeerLossPolicy};
use crate::error::{Failure, TransportError};
use crate::protocol::{InboundEvent, OutboundEvent, ProtocolEvent, SignalPayload};
use crate::stats::{StatsEvent, StatsHandle};
use crate::transport::{Connection, Connector};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use timers::{sleep_until_opt, Timer, Timers};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Searching,
    Waiting,
    Matched,
    Disconnecting,
}

impl ClientState {
    /// Whether the client holds an open connection in this state.
    pub fn is_online(self) -> bool {
        matches!(
            self,
            ClientState::Connected
                | ClientState::Searching
                | ClientState::Waiting
                | ClientState::Matched
                | ClientState::Disconnecting
        )
    }
}

/// What one lifecycle did, returned when it ends.
#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub client_id: String,
    pub final_state: ClientState,
    pub matches: u32,
    pub connects: u32,
    pub reconnects: u32,
    pub events_observed: usize,
    pub event_counts: BTreeMap<String, usize>,
}

enum Flow {
    Continue,
    Finish,
}

enum Exit {
    /// Run window over, cancelled, or the client chose to leave
    Finished,
    /// Transport dropped underneath the client
    Lost,
}

pub struct SimulatedClient {
    id: String,
    state: ClientState,
    room_id: Option<String>,
    peer_id: Option<String>,
    role: Role,
    search_started_at: Option<Instant>,
    waiting_since: Option<Instant>,
    matched_at: Option<Instant>,
    events: Vec<ProtocolEvent>,
    connects: u32,
    reconnects: u32,
    matches: u32,
    timers: Timers,
    conn: Option<Box<dyn Connection>>,
    signaling: SignalingSimulator,
    config: Arc<ClientConfig>,
    stats: StatsHandle,
}

impl SimulatedClient {
    pub fn new(id: impl Into<String>, config: Arc<ClientConfig>, stats: StatsHandle) -> Self {
        Self {
            id: id.into(),
            state: ClientState::Disconnected,
            room_id: None,
            peer_id: None,
            role: Role::default(),
            search_started_at: None,
            waiting_since: None,
            matched_at: None,
            events: Vec::new(),
            connects: 0,
            reconnects: 0,
            matches: 0,
            timers: Timers::default(),
            conn: None,
            signaling: SignalingSimulator::new(config.signaling.clone()),
            config,
            stats,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Every inbound event observed so far, in arrival order
    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    /// Drive the full lifecycle: connect, search, match, signal and re-search
    /// until the run duration elapses or `cancel` fires.
    pub async fn run(mut self, connector: &dyn Connector, cancel: &CancellationToken) -> ClientSummary {
        let deadline = Instant::now() + self.config.run_duration;
        self.stats.record(StatsEvent::ClientStarted);
        tracing::info!("{}: Starting (run duration {}s)", self.id, self.config.run_duration.as_secs());

        while self.connect(connector, cancel, deadline).await {
            match self.drive(cancel, deadline).await {
                Exit::Finished => break,
                Exit::Lost => {
                    if !self.config.reconnect.allows(self.reconnects) {
                        tracing::warn!("{}: Giving up after {} reconnects", self.id, self.reconnects);
                        break;
                    }
                    let delay = self.config.reconnect.delay_for(self.reconnects);
                    self.reconnects += 1;
                    tracing::info!("{}: Reconnecting in {}ms", self.id, delay.as_millis());
                    if !pause(delay, cancel, deadline).await {
                        break;
                    }
                }
            }
        }

        self.stop().await;
        self.stats.record(StatsEvent::ClientFinished {
            final_state: self.state,
        });
        let summary = self.summary();
        tracing::info!(
            "{}: Finished with {} matches, {} connects, {} events",
            self.id,
            summary.matches,
            summary.connects,
            summary.events_observed
        );
        summary
    }

    /// Connect with backoff. Returns false once attempts are exhausted or
    /// the run is over.
    async fn connect(&mut self, connector: &dyn Connector, cancel: &CancellationToken, deadline: Instant) -> bool {
        let backoff = self.config.connect_backoff.clone();
        let mut attempts = 0;
        loop {
            self.set_state(ClientState::Connecting);
            self.stats.record(StatsEvent::ConnectAttempt);
            attempts += 1;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = sleep_until(deadline) => None,
                r = timeout(self.config.connect_timeout, connector.connect(&self.config.server_url)) => Some(r),
            };

            let failure = match result {
                None => {
                    self.set_state(ClientState::Disconnected);
                    return false;
                }
                Some(Ok(Ok(conn))) => {
                    let elapsed = started.elapsed();
                    self.conn = Some(conn);
                    self.connects += 1;
                    if self.connects > 1 {
                        self.stats.record(StatsEvent::Reconnected);
                    }
                    self.stats.record(StatsEvent::Connected {
                        client_id: self.id.clone(),
                        elapsed,
                    });
                    self.set_state(ClientState::Connected);
                    tracing::info!("{}: Connected in {}ms", self.id, elapsed.as_millis());
                    return true;
                }
                Some(Ok(Err(e))) => Failure::Connect(e),
                Some(Err(_)) => Failure::ConnectTimeout(self.config.connect_timeout),
            };

            self.set_state(ClientState::Disconnected);
            self.fail(failure);

            if !backoff.allows(attempts) {
                tracing::warn!("{}: Giving up after {} connect attempts", self.id, attempts);
                return false;
            }
            if !pause(backoff.delay_for(attempts - 1), cancel, deadline).await {
                return false;
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken, deadline: Instant) -> Exit {
        self.start_search().await;
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Exit::Lost;
            };
            let next_timer = self.timers.next_deadline();

            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Exit::Finished,
                _ = sleep_until(deadline) => {
                    tracing::info!("{}: Run duration elapsed", self.id);
                    return Exit::Finished;
                }
                event = conn.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        self.connection_lost("transport closed");
                        Flow::Continue
                    }
                },
                _ = sleep_until_opt(next_timer) => {
                    self.fire_due_timers().await;
                    Flow::Continue
                }
            };

            if let Flow::Finish = flow {
                return Exit::Finished;
            }
        }
    }

    /// Emit `start-search` and enter `Searching`.
    pub async fn start_search(&mut self) {
        self.timers.disarm(|t| {
            matches!(
                t,
                Timer::WaitingTimeout | Timer::MatchTimeout | Timer::SearchRetry | Timer::MatchHold | Timer::Send(_)
            )
        });
        self.matched_at = None;
        self.set_state(ClientState::Searching);
        self.search_started_at = Some(Instant::now());

        if self.emit(OutboundEvent::StartSearch).await {
            self.stats.record(StatsEvent::SearchStarted);
            self.timers.arm_unique(self.config.waiting_timeout, Timer::WaitingTimeout);
            self.timers.arm_unique(self.config.match_timeout, Timer::MatchTimeout);
        }
    }

    /// Leave the current match and search again. No-op unless `Matched`.
    pub async fn skip(&mut self) {
        if self.state != ClientState::Matched {
            return;
        }
        let held = self.matched_at.map(|at| at.elapsed()).unwrap_or_default();
        tracing::info!(
            "{}: Skipping room {} after {}ms",
            self.id,
            self.room_id.as_deref().unwrap_or("?"),
            held.as_millis()
        );
        self.stats.record(StatsEvent::Skipped);
        if self.emit(OutboundEvent::Skip).await {
            self.start_search().await;
        }
    }

    /// Leave the run. Idempotent: a `Disconnected` client emits nothing.
    pub async fn stop(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        if matches!(self.state, ClientState::Searching | ClientState::Waiting) {
            self.emit(OutboundEvent::StopSearch).await;
        }
        self.timers.clear();
        if self.state != ClientState::Disconnected {
            self.set_state(ClientState::Disconnecting);
        }
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.set_state(ClientState::Disconnected);
    }

    async fn handle(&mut self, event: InboundEvent) -> Flow {
        tracing::debug!("{}: Received {} while {:?}", self.id, event.kind(), self.state);
        self.events.push(ProtocolEvent::observed(event.clone()));

        match event {
            InboundEvent::Connect => {}
            InboundEvent::Disconnect => self.connection_lost("server sent disconnect"),
            InboundEvent::ConnectError { reason } => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                self.fail(Failure::Connect(TransportError::Refused(reason)));
                self.drop_connection();
            }
            InboundEvent::WaitingForPeer => self.on_waiting(),
            InboundEvent::MatchReady {
                room_id,
                is_initiator,
                peer_id,
            } => self.on_match(room_id, is_initiator, peer_id).await,
            InboundEvent::PeerDisconnected => return self.on_peer_lost(false).await,
            InboundEvent::PeerSkipped => return self.on_peer_lost(true).await,
            InboundEvent::Signal(payload) => self.on_signal(&payload),
            InboundEvent::DebugInfo { state } => {
                tracing::debug!("{}: Server reports {}", self.id, state);
                self.timers.disarm(|t| *t == Timer::DebugProbe);
                self.stats.record(StatsEvent::DebugInfo);
            }
            InboundEvent::Unknown { kind } => {
                tracing::warn!("{}: Unknown event '{}'", self.id, kind);
                self.stats.record(StatsEvent::UnknownEvent);
            }
            InboundEvent::Malformed { kind, reason } if kind == "signal" => {
                self.fail(Failure::Signaling(format!("malformed signal: {}", reason)));
            }
            InboundEvent::Malformed { kind, reason } => {
                tracing::warn!("{}: Malformed '{}' event: {}", self.id, kind, reason);
                self.stats.record(StatsEvent::UnexpectedEvent);
            }
        }
        Flow::Continue
    }

    fn on_waiting(&mut self) {
        match self.state {
            ClientState::Searching => {
                self.timers
                    .disarm(|t| matches!(t, Timer::WaitingTimeout | Timer::SearchRetry));
                self.set_state(ClientState::Waiting);
                self.waiting_since = Some(Instant::now());
                self.stats.record(StatsEvent::WaitingForPeer);
            }
            ClientState::Waiting => self.stats.record(StatsEvent::WaitingForPeer),
            _ => self.unexpected("waiting_for_peer"),
        }
    }

    async fn on_match(&mut self, room_id: String, is_initiator: bool, peer_id: Option<String>) {
        if !matches!(self.state, ClientState::Searching | ClientState::Waiting) {
            self.unexpected("match_ready");
            return;
        }

        let now = Instant::now();
        let wait = self.waiting_since.map(|since| now - since);
        let search = self.search_started_at.map(|since| now - since);
        self.timers.disarm(|t| {
            matches!(t, Timer::WaitingTimeout | Timer::MatchTimeout | Timer::SearchRetry)
        });

        self.set_state(ClientState::Matched);
        self.room_id = Some(room_id.clone());
        self.peer_id = peer_id;
        self.role = Role::from_initiator(is_initiator);
        self.matched_at = Some(now);
        self.search_started_at = None;
        self.matches += 1;

        self.stats.record(StatsEvent::Matched {
            client_id: self.id.clone(),
            room_id: room_id.clone(),
            wait,
            search,
        });
        tracing::info!(
            "{}: Matched in room {} as {:?} (peer {})",
            self.id,
            room_id,
            self.role,
            self.peer_id.as_deref().unwrap_or("unknown")
        );

        if !self
            .emit(OutboundEvent::MatchReady {
                match_id: room_id.clone(),
            })
            .await
        {
            return;
        }
        if let Some((delay, offer)) = self.signaling.opening_offer(self.role, &room_id) {
            self.timers.arm(delay, Timer::Send(OutboundEvent::Signal(offer)));
        }
        self.timers.arm_unique(self.config.match_hold, Timer::MatchHold);
    }

    async fn on_peer_lost(&mut self, skipped: bool) -> Flow {
        self.stats.record(StatsEvent::PeerLost { skipped });
        let what = if skipped { "skipped" } else { "disconnected" };

        if matches!(
            self.state,
            ClientState::Disconnected | ClientState::Connecting | ClientState::Disconnecting
        ) {
            tracing::debug!("{}: Ignoring peer {} notice while {:?}", self.id, what, self.state);
            return Flow::Continue;
        }

        tracing::info!(
            "{}: Peer {} while {:?} (room {})",
            self.id,
            what,
            self.state,
            self.room_id.as_deref().unwrap_or("none")
        );
        match self.config.peer_loss {
            PeerLossPolicy::Research => {
                self.start_search().await;
                Flow::Continue
            }
            PeerLossPolicy::Disconnect => Flow::Finish,
        }
    }

    fn on_signal(&mut self, payload: &SignalPayload) {
        let room_id = match (&self.state, &self.room_id) {
            (ClientState::Matched, Some(room_id)) => room_id.clone(),
            _ => {
                self.fail(Failure::Signaling(format!("signal received while {:?}", self.state)));
                return;
            }
        };

        match self.signaling.respond(self.role, &room_id, payload) {
            Ok(SignalResponse::Reply {
                received,
                delay,
                payload,
            }) => {
                self.stats.record(StatsEvent::SignalReceived(received));
                self.timers.arm(delay, Timer::Send(OutboundEvent::Signal(payload)));
            }
            Ok(SignalResponse::Done { received }) => {
                self.stats.record(StatsEvent::SignalReceived(received));
            }
            Ok(SignalResponse::Unrecognised) => {
                tracing::debug!("{}: Unrecognised signal payload", self.id);
                self.stats.record(StatsEvent::SignalUnknown);
            }
            Err(failure) => self.fail(failure),
        }
    }

    async fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.timers.pop_due(now) {
            if self.conn.is_none() {
                break;
            }
            self.fire(timer).await;
        }
    }

    async fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::WaitingTimeout => {
                if self.state != ClientState::Searching {
                    return;
                }
                self.fail(Failure::WaitingTimeout(self.config.waiting_timeout));
                tracing::debug!("{}: Events so far: {:?}", self.id, self.event_counts());
                if self.emit(OutboundEvent::DebugState).await {
                    self.timers.arm_unique(self.config.debug_timeout, Timer::DebugProbe);
                    self.timers.arm_unique(self.config.search_retry_delay, Timer::SearchRetry);
                }
            }
            Timer::MatchTimeout => {
                if !matches!(self.state, ClientState::Searching | ClientState::Waiting) {
                    return;
                }
                self.fail(Failure::MatchTimeout(self.config.match_timeout));
                if self.emit(OutboundEvent::StopSearch).await {
                    self.start_search().await;
                }
            }
            Timer::DebugProbe => {
                tracing::warn!(
                    "{}: No debug_info within {}ms of debug-state",
                    self.id,
                    self.config.debug_timeout.as_millis()
                );
            }
            Timer::MatchHold => self.skip().await,
            Timer::SearchRetry => {
                if self.state == ClientState::Searching {
                    self.start_search().await;
                }
            }
            Timer::Send(event) => {
                if self.state == ClientState::Matched {
                    self.emit(event).await;
                }
            }
        }
    }

    /// Send one event. A failed send counts as a lost connection; returns
    /// whether the event went out.
    async fn emit(&mut self, event: OutboundEvent) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        let name = event.name();
        let signal = match &event {
            OutboundEvent::Signal(payload) => payload.kind(),
            _ => None,
        };

        let started = Instant::now();
        match conn.emit(event).await {
            Ok(()) => {
                self.stats.record(StatsEvent::EventLatency(started.elapsed()));
                if let Some(kind) = signal {
                    self.stats.record(StatsEvent::SignalSent(kind));
                }
                tracing::debug!("{}: Sent {}", self.id, name);
                true
            }
            Err(e) => {
                tracing::warn!("{}: Failed to send {}: {}", self.id, name, e);
                self.connection_lost("send failed");
                false
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        if self.conn.is_none() {
            return;
        }
        tracing::warn!("{}: Connection lost ({})", self.id, reason);
        self.drop_connection();
        self.fail(Failure::UnexpectedDisconnect);
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.timers.clear();
        self.set_state(ClientState::Disconnected);
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state == next {
            return;
        }
        if next != ClientState::Matched {
            self.room_id = None;
            self.peer_id = None;
        }
        if next != ClientState::Waiting {
            self.waiting_since = None;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.id, self.state, next);
        self.stats.record(StatsEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
        debug_assert!(
            self.room_id.is_none() || self.state == ClientState::Matched,
            "room_id held outside Matched"
        );
    }

    fn fail(&self, failure: Failure) {
        tracing::warn!("{}: {}", self.id, failure);
        self.stats.record(StatsEvent::Failure(failure.kind()));
    }

    fn unexpected(&self, kind: &str) {
        tracing::warn!("{}: Unexpected {} while {:?}", self.id, kind, self.state);
        self.stats.record(StatsEvent::UnexpectedEvent);
    }

    fn event_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for observed in &self.events {
            *counts.entry(observed.event.kind().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_id: self.id.clone(),
            final_state: self.state,
            matches: self.matches,
            connects: self.connects,
            reconnects: self.reconnects,
            events_observed: self.events.len(),
            event_counts: self.event_counts(),
        }
    }

    #[cfg(test)]
    fn attach(&mut self, conn: Box<dyn Connection>) {
        self.conn = Some(conn);
        self.connects += 1;
        self.set_state(ClientState::Connected);
    }

    /// Handle the next inbound event without running the timer loop.
    #[cfg(test)]
    async fn pump(&mut self) -> Option<InboundEvent> {
        let event = self.conn.as_mut()?.recv().await?;
        self.handle(event.clone()).await;
        Some(event)
    }
}

impl Drop for SimulatedClient {
    fn drop(&mut self) {
        // Aborted mid-lifecycle: settle the gauges this client still holds
        if self.state.is_online() {
            self.stats.record(StatsEvent::StateChanged {
                from: self.state,
                to: ClientState::Disconnected,
            });
        }
    }
}

/// Sleep for `delay` unless the run ends first. Returns false if interrupted.
async fn pause(delay: Duration, cancel: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep_until(deadline) => false,
        _ = sleep(delay) => true,
    }
}

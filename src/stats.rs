#![forbid(unsafe_code)]

// Run statistics - single-consumer aggregator fed by every simulated client

use crate::client::ClientState;
use crate::error::FailureKind;
use crate::protocol::SignalKind;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// One update from a client or the orchestrator.
#[derive(Debug, Clone)]
pub enum StatsEvent {
    ClientStarted,
    /// Never admitted before the run stopped
    ClientNotStarted,
    ClientFinished { final_state: ClientState },
    /// Lifecycle aborted after the grace period
    ForcedStop,
    ConnectAttempt,
    Connected { client_id: String, elapsed: Duration },
    Reconnected,
    StateChanged { from: ClientState, to: ClientState },
    SearchStarted,
    WaitingForPeer,
    Matched {
        client_id: String,
        room_id: String,
        /// `waiting_for_peer` to `match_ready`
        wait: Option<Duration>,
        /// `start-search` to `match_ready`
        search: Option<Duration>,
    },
    Skipped,
    PeerLost { skipped: bool },
    SignalSent(SignalKind),
    SignalReceived(SignalKind),
    SignalUnknown,
    DebugInfo,
    /// Time taken to hand one outbound event to the transport
    EventLatency(Duration),
    UnknownEvent,
    UnexpectedEvent,
    Failure(FailureKind),
}

/// Signal traffic counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalCounts {
    pub offers_sent: u64,
    pub offers_received: u64,
    pub answers_sent: u64,
    pub answers_received: u64,
    pub candidates_sent: u64,
    pub candidates_received: u64,
    pub unknown: u64,
}

impl SignalCounts {
    fn sent(&mut self, kind: SignalKind) {
        match kind {
            SignalKind::Offer => self.offers_sent += 1,
            SignalKind::Answer => self.answers_sent += 1,
            SignalKind::Candidate => self.candidates_sent += 1,
        }
    }

    fn received(&mut self, kind: SignalKind) {
        match kind {
            SignalKind::Offer => self.offers_received += 1,
            SignalKind::Answer => self.answers_received += 1,
            SignalKind::Candidate => self.candidates_received += 1,
        }
    }
}

/// Failure count per category, every category present
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct FailureCounts(BTreeMap<FailureKind, u64>);

impl Default for FailureCounts {
    fn default() -> Self {
        Self(FailureKind::ALL.iter().map(|k| (*k, 0)).collect())
    }
}

impl FailureCounts {
    pub fn get(&self, kind: FailureKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FailureKind, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    fn inc(&mut self, kind: FailureKind) {
        *self.0.entry(kind).or_insert(0) += 1;
    }
}

/// Point-in-time run statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub population: usize,
    pub clients_started: u64,
    pub clients_not_started: u64,
    pub clients_finished: u64,
    pub clients_finished_disconnected: u64,
    pub forced_stops: u64,
    pub connect_attempts: u64,
    pub total_connections: u64,
    /// Distinct clients that connected at least once
    pub successful_connections: usize,
    pub reconnects: u64,
    pub search_starts: u64,
    pub waiting_for_peer_events: u64,
    pub match_ready_events: u64,
    /// Distinct clients that reached `Matched` at least once
    pub matched_clients: usize,
    /// Rooms reported by both participants
    pub matches_created: u64,
    pub skips: u64,
    pub peer_disconnects: u64,
    pub peer_skips: u64,
    pub signals: SignalCounts,
    pub debug_info_events: u64,
    pub unknown_events: u64,
    pub unexpected_events: u64,
    pub failures: FailureCounts,
    pub currently_connected: u64,
    pub currently_waiting: u64,
    pub currently_matched: u64,
    #[serde(skip)]
    pub connect_times: Vec<Duration>,
    #[serde(skip)]
    pub wait_times: Vec<Duration>,
    #[serde(skip)]
    pub search_times: Vec<Duration>,
    #[serde(skip)]
    pub event_latencies: Vec<Duration>,
    #[serde(skip)]
    connected_ids: HashSet<String>,
    #[serde(skip)]
    matched_ids: HashSet<String>,
    #[serde(skip)]
    room_reports: HashMap<String, u32>,
}

impl Stats {
    pub fn new(population: usize) -> Self {
        Self {
            population,
            ..Self::default()
        }
    }

    fn apply(&mut self, event: StatsEvent) {
        match event {
            StatsEvent::ClientStarted => self.clients_started += 1,
            StatsEvent::ClientNotStarted => self.clients_not_started += 1,
            StatsEvent::ClientFinished { final_state } => {
                self.clients_finished += 1;
                if final_state == ClientState::Disconnected {
                    self.clients_finished_disconnected += 1;
                }
            }
            StatsEvent::ForcedStop => self.forced_stops += 1,
            StatsEvent::ConnectAttempt => self.connect_attempts += 1,
            StatsEvent::Connected { client_id, elapsed } => {
                self.total_connections += 1;
                self.connected_ids.insert(client_id);
                self.successful_connections = self.connected_ids.len();
                self.connect_times.push(elapsed);
            }
            StatsEvent::Reconnected => self.reconnects += 1,
            StatsEvent::StateChanged { from, to } => self.track_gauges(from, to),
            StatsEvent::SearchStarted => self.search_starts += 1,
            StatsEvent::WaitingForPeer => self.waiting_for_peer_events += 1,
            StatsEvent::Matched {
                client_id,
                room_id,
                wait,
                search,
            } => {
                self.match_ready_events += 1;
                self.matched_ids.insert(client_id);
                self.matched_clients = self.matched_ids.len();
                let reports = self.room_reports.entry(room_id).or_insert(0);
                *reports += 1;
                // Servers may reuse room ids; every second report closes a pair
                if *reports % 2 == 0 {
                    self.matches_created += 1;
                }
                self.wait_times.extend(wait);
                self.search_times.extend(search);
            }
            StatsEvent::Skipped => self.skips += 1,
            StatsEvent::PeerLost { skipped: true } => self.peer_skips += 1,
            StatsEvent::PeerLost { skipped: false } => self.peer_disconnects += 1,
            StatsEvent::SignalSent(kind) => self.signals.sent(kind),
            StatsEvent::SignalReceived(kind) => self.signals.received(kind),
            StatsEvent::SignalUnknown => self.signals.unknown += 1,
            StatsEvent::DebugInfo => self.debug_info_events += 1,
            StatsEvent::EventLatency(latency) => self.event_latencies.push(latency),
            StatsEvent::UnknownEvent => self.unknown_events += 1,
            StatsEvent::UnexpectedEvent => self.unexpected_events += 1,
            StatsEvent::Failure(kind) => self.failures.inc(kind),
        }
    }

    fn track_gauges(&mut self, from: ClientState, to: ClientState) {
        fn step(gauge: &mut u64, was: bool, is: bool) {
            match (was, is) {
                (false, true) => *gauge += 1,
                (true, false) => *gauge = gauge.saturating_sub(1),
                _ => {}
            }
        }
        step(&mut self.currently_connected, from.is_online(), to.is_online());
        step(
            &mut self.currently_waiting,
            from == ClientState::Waiting,
            to == ClientState::Waiting,
        );
        step(
            &mut self.currently_matched,
            from == ClientState::Matched,
            to == ClientState::Matched,
        );
    }

    /// Health warnings for a progress report, `elapsed` into the run.
    pub fn health_warnings(&self, elapsed: Duration) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.search_starts > 0 && self.matches_created == 0 && elapsed > Duration::from_secs(20) {
            warnings.push("clients are searching but no matches are being created".to_string());
        }
        if self.search_starts > 0 && self.waiting_for_peer_events == 0 && elapsed > Duration::from_secs(10) {
            warnings.push("start-search sent but no waiting_for_peer received".to_string());
        }
        let connect_failures =
            self.failures.get(FailureKind::ConnectError) + self.failures.get(FailureKind::ConnectTimeout);
        if connect_failures > 0 {
            warnings.push(format!("{} connection failures so far", connect_failures));
        }
        warnings
    }
}

/// Summary statistics over one sample set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

impl DistributionSummary {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().map(|d| d.as_nanos() as f64 / 1e6).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mid = count / 2;
        let median_ms = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count,
            mean_ms: sorted.iter().sum::<f64>() / count as f64,
            median_ms,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            p95_ms: percentile(&sorted, 0.95),
        })
    }
}

fn percentile(sorted_data: &[f64], p: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Final run report: the last snapshot plus derived metrics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub stats: Stats,
    pub elapsed_ms: u64,
    pub interrupted: bool,
    pub connection_rate: f64,
    pub match_rate: f64,
    pub connect_time: Option<DistributionSummary>,
    pub wait_time: Option<DistributionSummary>,
    pub search_time: Option<DistributionSummary>,
    pub event_latency: Option<DistributionSummary>,
}

impl FinalReport {
    pub fn new(stats: Stats, elapsed: Duration, interrupted: bool) -> Self {
        Self {
            elapsed_ms: elapsed.as_millis() as u64,
            interrupted,
            connection_rate: percent(stats.successful_connections, stats.population),
            match_rate: percent(stats.matched_clients, stats.population),
            connect_time: DistributionSummary::from_samples(&stats.connect_times),
            wait_time: DistributionSummary::from_samples(&stats.wait_times),
            search_time: DistributionSummary::from_samples(&stats.search_times),
            event_latency: DistributionSummary::from_samples(&stats.event_latencies),
            stats,
        }
    }

    pub fn print_summary(&self) {
        let s = &self.stats;
        println!("\n=== Matchmaking Load Test Summary ===");
        println!("Total clients: {}", s.population);
        println!("Started: {}  Not started: {}  Forced stops: {}",
            s.clients_started, s.clients_not_started, s.forced_stops);
        println!("Successful connections: {} ({:.1}%)", s.successful_connections, self.connection_rate);
        println!("Connect attempts: {}  Reconnects: {}", s.connect_attempts, s.reconnects);

        println!("\nMatchmaking:");
        println!("  Search starts: {}", s.search_starts);
        println!("  Waiting-for-peer: {}", s.waiting_for_peer_events);
        println!("  Match-ready: {}", s.match_ready_events);
        println!("  Matches created: {}", s.matches_created);
        println!("  Clients matched: {} ({:.1}%)", s.matched_clients, self.match_rate);
        println!("  Skips: {}  Peer skips: {}  Peer disconnects: {}",
            s.skips, s.peer_skips, s.peer_disconnects);
        println!("  Debug info: {}", s.debug_info_events);

        print_distribution("Connect time", &self.connect_time);
        print_distribution("Wait time (waiting_for_peer to match)", &self.wait_time);
        print_distribution("Search time (start-search to match)", &self.search_time);
        print_distribution("Event latency", &self.event_latency);

        println!("\nSignaling:");
        println!("  Offers: {} sent, {} received", s.signals.offers_sent, s.signals.offers_received);
        println!("  Answers: {} sent, {} received", s.signals.answers_sent, s.signals.answers_received);
        println!("  Candidates: {} sent, {} received",
            s.signals.candidates_sent, s.signals.candidates_received);
        println!("  Unknown signals: {}", s.signals.unknown);

        println!("\nErrors and timeouts:");
        for (kind, count) in s.failures.iter() {
            println!("  {}: {}", kind.label(), count);
        }
        println!("  Unknown events: {}", s.unknown_events);
        println!("  Unexpected events: {}", s.unexpected_events);

        println!("\nRun {} after {:.1}s",
            if self.interrupted { "interrupted" } else { "completed" },
            self.elapsed_ms as f64 / 1000.0);
        println!("=====================================\n");
    }
}

fn print_distribution(title: &str, summary: &Option<DistributionSummary>) {
    if let Some(d) = summary {
        println!("\n{} (n={}):", title, d.count);
        println!("  Average: {:.2} ms  Median: {:.2} ms", d.mean_ms, d.median_ms);
        println!("  Min: {:.2} ms  Max: {:.2} ms  P95: {:.2} ms", d.min_ms, d.max_ms, d.p95_ms);
    }
}

enum Command {
    Record(StatsEvent),
    Snapshot(oneshot::Sender<Stats>),
    Finish(oneshot::Sender<Stats>),
}

/// Cheap, cloneable sender side of the aggregator.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StatsHandle {
    /// Queue an update. Never blocks; dropped if the aggregator has finished.
    pub fn record(&self, event: StatsEvent) {
        if self.tx.send(Command::Record(event)).is_err() {
            debug!("stats aggregator gone, dropping update");
        }
    }

    /// Snapshot reflecting every update this handle queued before the call.
    pub async fn snapshot(&self) -> Result<Stats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(tx))
            .map_err(|_| anyhow!("stats aggregator stopped"))?;
        Ok(rx.await?)
    }
}

/// Owns the consumer task that applies every update in arrival order.
pub struct StatsAggregator {
    handle: StatsHandle,
    worker: JoinHandle<()>,
}

impl StatsAggregator {
    pub fn spawn(population: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(consume(rx, Stats::new(population)));
        Self {
            handle: StatsHandle { tx },
            worker,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    pub async fn snapshot(&self) -> Result<Stats> {
        self.handle.snapshot().await
    }

    /// Stop the consumer and derive the final report. Updates queued before
    /// this call are included; later ones are dropped.
    pub async fn final_report(self, elapsed: Duration, interrupted: bool) -> Result<FinalReport> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .tx
            .send(Command::Finish(tx))
            .map_err(|_| anyhow!("stats aggregator stopped"))?;
        let stats = rx.await?;
        self.worker.await?;
        Ok(FinalReport::new(stats, elapsed, interrupted))
    }
}

async fn consume(mut rx: mpsc::UnboundedReceiver<Command>, mut stats: Stats) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(event) => stats.apply(event),
            Command::Snapshot(reply) => {
                let _ = reply.send(stats.clone());
            }
            Command::Finish(reply) => {
                let _ = reply.send(stats);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn matched(client: &str, room: &str) -> StatsEvent {
        StatsEvent::Matched {
            client_id: client.to_string(),
            room_id: room.to_string(),
            wait: Some(ms(100)),
            search: Some(ms(300)),
        }
    }

    #[tokio::test]
    async fn test_matches_counted_once_per_pair() {
        let aggregator = StatsAggregator::spawn(3);
        let stats = aggregator.handle();

        stats.record(matched("a", "r1"));
        let half = aggregator.snapshot().await.unwrap();
        assert_eq!(half.matches_created, 0);
        assert_eq!(half.match_ready_events, 1);

        stats.record(matched("b", "r1"));
        stats.record(matched("c", "r2"));

        let report = aggregator.final_report(ms(1000), false).await.unwrap();
        assert_eq!(report.stats.matches_created, 1);
        assert_eq!(report.stats.matched_clients, 3);
        assert!(report.stats.matches_created * 2 <= report.stats.match_ready_events);
        assert_eq!(report.wait_time.as_ref().map(|d| d.count), Some(3));
    }

    #[tokio::test]
    async fn test_reused_room_id_counts_each_pair() {
        let aggregator = StatsAggregator::spawn(2);
        let stats = aggregator.handle();

        for _ in 0..3 {
            stats.record(matched("a", "r1"));
            stats.record(matched("b", "r1"));
        }
        stats.record(matched("a", "r1"));

        let snapshot = aggregator.snapshot().await.unwrap();
        assert_eq!(snapshot.matches_created, 3);
        assert_eq!(snapshot.match_ready_events, 7);
        assert_eq!(snapshot.matched_clients, 2);
    }

    #[tokio::test]
    async fn test_gauges_pair_up() {
        let aggregator = StatsAggregator::spawn(1);
        let stats = aggregator.handle();
        use ClientState::*;

        let path = [Disconnected, Connecting, Connected, Searching, Waiting, Matched, Searching];
        for pair in path.windows(2) {
            stats.record(StatsEvent::StateChanged { from: pair[0], to: pair[1] });
        }
        let mid = stats.snapshot().await.unwrap();
        assert_eq!(mid.currently_connected, 1);
        assert_eq!(mid.currently_waiting, 0);
        assert_eq!(mid.currently_matched, 0);

        stats.record(StatsEvent::StateChanged { from: Searching, to: Waiting });
        assert_eq!(stats.snapshot().await.unwrap().currently_waiting, 1);

        stats.record(StatsEvent::StateChanged { from: Waiting, to: Disconnecting });
        stats.record(StatsEvent::StateChanged { from: Disconnecting, to: Disconnected });
        let end = stats.snapshot().await.unwrap();
        assert_eq!(end.currently_connected, 0);
        assert_eq!(end.currently_waiting, 0);

        // A stray decrement never underflows
        stats.record(StatsEvent::StateChanged { from: Matched, to: Disconnected });
        assert_eq!(stats.snapshot().await.unwrap().currently_matched, 0);
    }

    #[tokio::test]
    async fn test_distinct_connections() {
        let aggregator = StatsAggregator::spawn(2);
        let stats = aggregator.handle();
        for elapsed in [ms(10), ms(30)] {
            stats.record(StatsEvent::Connected { client_id: "a".into(), elapsed });
        }
        stats.record(StatsEvent::Connected { client_id: "b".into(), elapsed: ms(20) });
        stats.record(StatsEvent::Failure(FailureKind::ConnectTimeout));

        let report = aggregator.final_report(ms(50), true).await.unwrap();
        assert_eq!(report.stats.total_connections, 3);
        assert_eq!(report.stats.successful_connections, 2);
        assert_eq!(report.connection_rate, 100.0);
        assert_eq!(report.stats.failures.get(FailureKind::ConnectTimeout), 1);
        assert_eq!(report.stats.failures.total(), 1);
        assert!(report.interrupted);
        let connect = report.connect_time.unwrap();
        assert_eq!(connect.median_ms, 20.0);
        assert_eq!(connect.min_ms, 10.0);
        assert_eq!(connect.max_ms, 30.0);
    }

    #[tokio::test]
    async fn test_record_after_finish_is_silent() {
        let aggregator = StatsAggregator::spawn(1);
        let stats = aggregator.handle();
        aggregator.final_report(ms(1), false).await.unwrap();
        stats.record(StatsEvent::SearchStarted);
        assert!(stats.snapshot().await.is_err());
    }

    #[test]
    fn test_distribution_summary() {
        assert_eq!(DistributionSummary::from_samples(&[]), None);

        let d = DistributionSummary::from_samples(&[ms(40), ms(10), ms(30), ms(20)]).unwrap();
        assert_eq!(d.count, 4);
        assert_eq!(d.mean_ms, 25.0);
        assert_eq!(d.median_ms, 25.0);
        assert_eq!(d.min_ms, 10.0);
        assert_eq!(d.max_ms, 40.0);
        assert_eq!(d.p95_ms, 40.0);
    }

    #[test]
    fn test_health_warnings() {
        let mut stats = Stats::new(4);
        assert!(stats.health_warnings(Duration::from_secs(30)).is_empty());

        stats.search_starts = 4;
        assert!(stats.health_warnings(Duration::from_secs(5)).is_empty());
        assert_eq!(stats.health_warnings(Duration::from_secs(15)).len(), 1);
        assert_eq!(stats.health_warnings(Duration::from_secs(25)).len(), 2);

        stats.failures.inc(FailureKind::ConnectError);
        assert_eq!(stats.health_warnings(Duration::from_secs(1)).len(), 1);
    }
}

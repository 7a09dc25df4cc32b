#![forbid(unsafe_code)]

// Orchestrator - admits the client population and drives the run to a report

use crate::client::timers::sleep_until_opt;
use crate::client::{ClientSummary, SimulatedClient};
use crate::config::{RampUp, RunConfig};
use crate::error::Failure;
use crate::stats::{FinalReport, StatsAggregator, StatsEvent, StatsHandle};
use crate::transport::Connector;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Orchestrator<C: Connector> {
    config: RunConfig,
    connector: Arc<C>,
}

impl<C: Connector> Orchestrator<C> {
    pub fn new(config: RunConfig, connector: C) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
        }
    }

    /// Run the whole population and return the final report.
    ///
    /// Fails only when the preflight connect fails. Cancelling `cancel` stops
    /// admission, asks every running client to stop and marks the report as
    /// interrupted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<FinalReport> {
        let started = Instant::now();
        let run_deadline = self.config.deadline.map(|d| started + d);
        let population = self.config.population;

        if self.config.preflight {
            self.preflight().await?;
        }

        info!(
            "Starting run: {} clients, concurrency {}, {:?}",
            population,
            self.config.concurrency_cap(),
            self.config.ramp_up
        );

        let aggregator = StatsAggregator::spawn(population);
        let stats = aggregator.handle();
        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(report_progress(
            stats.clone(),
            self.config.report_interval,
            started,
            reporter_stop.clone(),
        ));

        let clients_cancel = cancel.child_token();
        let mut lifecycles = JoinSet::new();
        let admitted = self
            .admit(&mut lifecycles, &stats, &cancel, &clients_cancel, run_deadline)
            .await;
        for _ in admitted..population {
            stats.record(StatsEvent::ClientNotStarted);
        }
        if admitted < population {
            info!("Admission stopped: {} of {} clients never started", population - admitted, population);
        }

        self.drain(&mut lifecycles, &stats, &cancel, &clients_cancel, run_deadline)
            .await;

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            warn!("Progress reporter failed: {}", e);
        }

        let interrupted = cancel.is_cancelled();
        aggregator.final_report(started.elapsed(), interrupted).await
    }

    async fn preflight(&self) -> Result<()> {
        let url = &self.config.client.server_url;
        let limit = self.config.client.connect_timeout;
        info!("Preflight: connecting to {}", url);

        let mut conn = timeout(limit, self.connector.connect(url))
            .await
            .map_err(|_| anyhow!("preflight connect to {} timed out after {}s", url, limit.as_secs()))?
            .with_context(|| format!("preflight connect to {} failed", url))?;
        conn.close().await;

        info!("Preflight: server reachable");
        Ok(())
    }

    /// Spawn lifecycles in order until the population is exhausted or the
    /// run is stopped. Returns how many were admitted.
    async fn admit(
        &self,
        lifecycles: &mut JoinSet<ClientSummary>,
        stats: &StatsHandle,
        cancel: &CancellationToken,
        clients_cancel: &CancellationToken,
        run_deadline: Option<Instant>,
    ) -> usize {
        let population = self.config.population;
        let slots = Arc::new(Semaphore::new(self.config.concurrency_cap()));
        let client_config = Arc::new(self.config.client.clone());
        let mut admitted = 0;

        for index in 0..population {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until_opt(run_deadline) => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let client = SimulatedClient::new(format!("client-{}", index), client_config.clone(), stats.clone());
            let connector = self.connector.clone();
            let token = clients_cancel.clone();
            lifecycles.spawn(async move {
                let _permit = permit;
                client.run(&*connector, &token).await
            });
            admitted += 1;

            if let RampUp::Staggered { delay } = self.config.ramp_up {
                if index + 1 < population {
                    debug!("Waiting {}ms before admitting next client", delay.as_millis());
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep_until_opt(run_deadline) => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        admitted
    }

    /// Wait for every lifecycle. On cancellation or deadline, stop clients and
    /// abort whatever is still running once the grace period is over.
    async fn drain(
        &self,
        lifecycles: &mut JoinSet<ClientSummary>,
        stats: &StatsHandle,
        cancel: &CancellationToken,
        clients_cancel: &CancellationToken,
        run_deadline: Option<Instant>,
    ) {
        let grace = self.config.grace_period;
        let mut grace_end: Option<Instant> = None;
        let mut aborted = false;

        loop {
            let stopping = grace_end.is_some();
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => {
                    info!("Run cancelled, stopping {} clients", lifecycles.len());
                    clients_cancel.cancel();
                    grace_end = Some(Instant::now() + grace);
                }
                _ = sleep_until_opt(run_deadline), if !stopping => {
                    info!("Run deadline reached, stopping {} clients", lifecycles.len());
                    clients_cancel.cancel();
                    grace_end = Some(Instant::now() + grace);
                }
                _ = sleep_until_opt(grace_end), if !aborted => {
                    warn!("Grace period over, aborting {} clients", lifecycles.len());
                    lifecycles.abort_all();
                    aborted = true;
                }
                joined = lifecycles.join_next() => match joined {
                    None => break,
                    Some(Ok(summary)) => {
                        debug!("{}: Lifecycle ended in {:?}", summary.client_id, summary.final_state);
                    }
                    Some(Err(e)) if e.is_panic() => {
                        let failure = Failure::Lifecycle(e.to_string());
                        error!("Client {}", failure);
                        stats.record(StatsEvent::Failure(failure.kind()));
                    }
                    Some(Err(_)) => stats.record(StatsEvent::ForcedStop),
                },
            }
        }
    }
}

async fn report_progress(stats: StatsHandle, every: Duration, started: Instant, stop: CancellationToken) {
    // A zero interval turns progress reporting off
    if every.is_zero() {
        stop.cancelled().await;
        return;
    }
    let mut ticker = interval_at(started + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let Ok(s) = stats.snapshot().await else {
                    return;
                };
                let elapsed = started.elapsed();
                info!(
                    "[{}s] connected {} ({} distinct), waiting {}, matched {}, matches created {}, failures {}",
                    elapsed.as_secs(),
                    s.currently_connected,
                    s.successful_connections,
                    s.currently_waiting,
                    s.currently_matched,
                    s.matches_created,
                    s.failures.total()
                );
                for warning in s.health_warnings(elapsed) {
                    warn!("{}", warning);
                }
            }
        }
    }
}

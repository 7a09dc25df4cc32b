#![forbid(unsafe_code)]

//! matchload - drive a population of simulated users against a matchmaking server
//!
//! Usage:
//!   matchload --users 20 --duration 60
//!   matchload --users 200 --concurrency 50 --ramp-up simultaneous --deadline 120
//!   MATCHLOAD_SERVER=ws://10.0.0.5:3001 matchload --users 10 --output summary.json

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use matchload::transport::WsConnector;
use matchload::{Orchestrator, PeerLossPolicy, RampUp, RunConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RampMode {
    Staggered,
    Simultaneous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PeerLoss {
    /// Search again straight away
    Research,
    /// End the client's session
    Disconnect,
}

/// Matchmaking load tester
///
/// Connects simulated users, drives them through search, match and
/// placeholder signaling, and reports what the server did.
#[derive(Parser, Debug)]
#[command(name = "matchload")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of simulated users
    #[arg(short = 'u', long, default_value = "10")]
    users: usize,

    /// How long each user stays in the run, in seconds
    #[arg(short = 'd', long, default_value = "30")]
    duration: u64,

    /// Maximum users running at once. Defaults to all of them.
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Matchmaking server URL
    #[arg(short = 's', long, env = "MATCHLOAD_SERVER", default_value = "ws://localhost:3001")]
    server: String,

    /// How users are introduced into the run
    #[arg(long, value_enum, default_value_t = RampMode::Staggered)]
    ramp_up: RampMode,

    /// Delay between staggered admissions, in milliseconds
    #[arg(long, default_value = "500")]
    stagger_ms: u64,

    /// Overall run limit in seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Seconds users get to stop after cancellation or the deadline
    #[arg(long, default_value = "10")]
    grace: u64,

    /// Seconds a user stays matched before skipping
    #[arg(long, default_value = "8")]
    match_hold: u64,

    /// What a user does when its peer leaves
    #[arg(long, value_enum, default_value_t = PeerLoss::Research)]
    on_peer_loss: PeerLoss,

    /// Skip the connectivity check before the run
    #[arg(long)]
    no_preflight: bool,

    /// Write the final report as JSON to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log every protocol event
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig {
            population: self.users,
            concurrency: self.concurrency,
            ramp_up: match self.ramp_up {
                RampMode::Staggered => RampUp::Staggered {
                    delay: Duration::from_millis(self.stagger_ms),
                },
                RampMode::Simultaneous => RampUp::Simultaneous,
            },
            deadline: self.deadline.map(Duration::from_secs),
            grace_period: Duration::from_secs(self.grace),
            preflight: !self.no_preflight,
            ..RunConfig::default()
        };
        config.client.server_url = self.server.clone();
        config.client.run_duration = Duration::from_secs(self.duration);
        config.client.match_hold = Duration::from_secs(self.match_hold);
        config.client.peer_loss = match self.on_peer_loss {
            PeerLoss::Research => PeerLossPolicy::Research,
            PeerLoss::Disconnect => PeerLossPolicy::Disconnect,
        };
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug { "matchload=debug" } else { "matchload=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = args.run_config();

    println!("\n=== Matchmaking Load Test ===");
    println!("Server: {}", config.client.server_url);
    println!("Users: {} (concurrency {})", config.population, config.concurrency_cap());
    println!("Duration: {}s per user", args.duration);
    println!("Ramp-up: {:?}", config.ramp_up);
    if let Some(deadline) = config.deadline {
        println!("Deadline: {}s", deadline.as_secs());
    }
    println!("=============================\n");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping run");
            on_interrupt.cancel();
        }
    });

    let population = config.population;
    let report = Orchestrator::new(config, WsConnector).run(cancel).await?;
    report.print_summary();

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Summary saved to: {}", path.display());
    }

    if population > 0 && report.stats.successful_connections == 0 {
        error!("No user ever connected to {}", args.server);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

//! # punchclock
//!
//! Runs the daily time-clock flow on a schedule and exposes it over HTTP.
//!
//! Usage:
//!   punchclock serve                      # HTTP API, restart recovery, optional auto start
//!   punchclock run --supervision          # Run today's flow in the foreground
//!   punchclock status                     # Current phase and message
//!   punchclock events --limit 50          # Recent runtime events
//!   punchclock history --day 2026-02-23   # Clicks executed on a day
//!   punchclock retry                      # Re-enter the flow at the failed action
//!   punchclock reset                      # Clear a failed or completed day
//!   punchclock settings set 2026-12-24 2026-12-31

mod process_lock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use punchclock_core::PunchConfig;
use punchclock_gateway::AppState;
use punchclock_scheduler::{DryRunDriver, FlowEngine, NoopNotifier, Phase, RunOutcome};

#[derive(Parser)]
#[command(
    name = "punchclock",
    version,
    about = "⏱️ punchclock: scheduled daily time-clock automation"
)]
struct Cli {
    /// Config file (default: ~/.punchclock/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway, resume an interrupted run and auto-start if enabled
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run today's flow in the foreground
    Run {
        /// Job name (default: job_name from the config)
        #[arg(long)]
        job: Option<String>,
        /// Proceed when a sign-in page shows up instead of failing
        #[arg(long)]
        supervision: bool,
        /// Explicit run id
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Show the current status
    Status,
    /// List recent runtime events
    Events {
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only events of this local day (YYYY-MM-DD)
        #[arg(long)]
        day: Option<NaiveDate>,
    },
    /// Clicks executed on a day (default today)
    History {
        #[arg(long)]
        day: Option<NaiveDate>,
    },
    /// Retry the failed action of today's run
    Retry,
    /// Reset a failed or completed session
    Reset,
    /// Blocked-day settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show the blocked range
    Show,
    /// Block every day from START to END (inclusive)
    Set { start: String, end: String },
    /// Remove the blocked range
    Clear,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    let icon = if outcome.ok { "✅" } else { "❌" };
    println!(
        "{icon} {} [{}] {}: {}",
        outcome.job, outcome.run_id, outcome.phase, outcome.message
    );
}

/// Engine for commands that never click or notify.
fn offline_engine(config: &PunchConfig) -> Result<FlowEngine> {
    Ok(FlowEngine::new(
        config,
        Arc::new(DryRunDriver::new()),
        Arc::new(NoopNotifier),
    )?)
}

/// Stop waiting runs on Ctrl-C; their persisted state stays resumable.
fn shutdown_on_ctrl_c(engine: Arc<FlowEngine>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Shutdown requested");
            engine.shutdown();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "punchclock=debug,punchclock_scheduler=debug,punchclock_gateway=debug,tower_http=debug"
    } else {
        "punchclock=info,punchclock_scheduler=info,punchclock_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => PunchConfig::load_from(path),
        None => PunchConfig::load(),
    }
    .context("failed to load configuration")?;
    let data_dir = config.data_dir();

    match cli.command {
        Command::Serve { port } => {
            let _lock = process_lock::acquire(&data_dir)?;
            let engine = Arc::new(FlowEngine::from_config(&config)?);
            shutdown_on_ctrl_c(engine.clone());

            let missing = config.missing_required();
            if !missing.is_empty() {
                tracing::warn!("⚠️ Missing required config: {}", missing.join(", "));
            }

            println!("⏱️ punchclock v{}", env!("CARGO_PKG_VERSION"));
            println!("   📂 Data Dir:  {}", data_dir.display());
            println!("   🧾 Job:       {}", engine.job_name());
            println!(
                "   🌐 API:       http://{}:{}/status",
                config.gateway.host,
                port.unwrap_or(config.gateway.port)
            );
            println!();

            if engine.state().phase.is_active() {
                let eng = engine.clone();
                tokio::spawn(async move {
                    tracing::info!("🔄 Resuming interrupted run");
                    match eng.resume_pending_flow().await {
                        Ok(outcome) => print_outcome(&outcome),
                        Err(e) => tracing::warn!("⚠️ Resume ended: {e}"),
                    }
                });
            }

            if config.schedule.auto_start {
                let eng = engine.clone();
                let tick = config.schedule.tick_secs;
                tokio::spawn(async move {
                    punchclock_scheduler::spawn_auto_start(eng, tick).await;
                });
            }

            let mut gateway = config.gateway.clone();
            if let Some(port) = port {
                gateway.port = port;
            }
            let state = AppState::new(engine, config.job_secret.clone());
            punchclock_gateway::start_server(&gateway, state)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }

        Command::Run {
            job,
            supervision,
            run_id,
        } => {
            let _lock = process_lock::acquire(&data_dir)?;
            let engine = Arc::new(FlowEngine::from_config(&config)?);
            shutdown_on_ctrl_c(engine.clone());
            let job = job.unwrap_or_else(|| engine.job_name().to_string());
            let outcome = engine.run(&job, supervision, run_id).await?;
            print_outcome(&outcome);
        }

        Command::Status => {
            let engine = offline_engine(&config)?;
            let status = engine.status();
            println!("📋 {} [{}]", status.phase, status.job);
            println!("   {}", status.message);
            if cli.verbose {
                print_json(&status)?;
            }
        }

        Command::Events { limit, day } => {
            let engine = offline_engine(&config)?;
            for event in engine.runtime_events(limit, day)? {
                let phase = event.phase.map(|p| p.to_string()).unwrap_or_default();
                println!(
                    "{} {:<28} {:<22} {} {}",
                    event.ts.format("%Y-%m-%d %H:%M:%S"),
                    serde_json::to_value(event.event)?.as_str().unwrap_or_default(),
                    phase,
                    event.run_id,
                    event.meta
                );
            }
        }

        Command::History { day } => {
            let engine = offline_engine(&config)?;
            let day = day.unwrap_or_else(|| engine.now().date_naive());
            let clicks = engine.daily_click_history(day)?;
            if clicks.is_empty() {
                println!("📭 No clicks on {day}");
            }
            for click in clicks {
                let icon = if click.ok { "✅" } else { "❌" };
                let recovered = if click.recovered { " (recovered)" } else { "" };
                println!(
                    "{icon} {:<18} executed {} scheduled {} [{}]{recovered}",
                    click.click_name, click.executed_at, click.scheduled_at, click.run_id
                );
            }
        }

        Command::Retry => {
            let _lock = process_lock::acquire(&data_dir)?;
            let engine = Arc::new(FlowEngine::from_config(&config)?);
            shutdown_on_ctrl_c(engine.clone());
            let outcome = engine.retry_failed_action().await?;
            print_outcome(&outcome);
        }

        Command::Reset => {
            let _lock = process_lock::acquire(&data_dir)
                .context("stop `punchclock serve` or use POST /reset-session")?;
            let engine = offline_engine(&config)?;
            let outcome = engine.reset_session()?;
            if outcome.reset {
                println!("🧹 Session reset (was {})", outcome.previous_phase);
            } else if outcome.previous_phase == Phase::BeforeStart {
                println!("ℹ️ Nothing to reset");
            }
        }

        Command::Settings { action } => {
            let engine = offline_engine(&config)?;
            let settings = match action {
                SettingsAction::Show => engine.settings(),
                SettingsAction::Set { start, end } => {
                    let _lock = process_lock::acquire(&data_dir)
                        .context("stop `punchclock serve` or use PUT /settings")?;
                    engine.update_settings(&start, &end)?
                }
                SettingsAction::Clear => {
                    let _lock = process_lock::acquire(&data_dir)
                        .context("stop `punchclock serve` or use PUT /settings")?;
                    engine.update_settings("", "")?
                }
            };
            match (settings.blocked_start_date, settings.blocked_end_date) {
                (Some(start), Some(end)) => println!("🚫 Blocked: {start} → {end}"),
                _ => println!("✅ No blocked days"),
            }
        }
    }

    Ok(())
}

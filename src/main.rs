//! Capital Rebalancer - Main Entry Point
//!
//! Runs paper simulations of a weighted multi-strategy portfolio and inspects
//! the persisted state they leave behind.

use anyhow::Result;
use capital_rebalancer::config::Config;
use capital_rebalancer::persistence::PersistenceManager;
use capital_rebalancer::portfolio::RebalanceOutcome;
use capital_rebalancer::simulation::SimulationEngine;
use capital_rebalancer::utils::decimal::bps_to_percent;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Capital Rebalancer CLI
#[derive(Parser)]
#[command(name = "capital-rebalancer")]
#[command(version, about = "Weighted capital allocation across strategy backends")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper simulation using the configured targets
    Simulate {
        /// Number of steps (overrides simulation.cycles)
        #[arg(short, long)]
        cycles: Option<u32>,

        /// Initial deposit in base units (overrides simulation.initial_deposit)
        #[arg(short = 'd', long)]
        deposit: Option<u64>,

        /// Simulated start date (YYYY-MM-DD, default: now)
        #[arg(short, long)]
        start: Option<String>,

        /// Persist snapshots and rebalance history to the configured database
        #[arg(long)]
        persist: bool,

        /// Output directory for the value curve and JSON results
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Show the last persisted portfolio snapshot
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(long)]
        db: Option<String>,

        /// Show retired targets and rebalance history
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Simulate {
            cycles,
            deposit,
            start,
            persist,
            output,
        }) => run_simulation(config, cycles, deposit, start.as_deref(), persist, output.as_deref()).await,
        Some(Commands::Status { db, verbose }) => {
            let db_path = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&db_path, verbose)
        }
        None => run_simulation(config, None, None, None, false, None).await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "capital-rebalancer.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("capital_rebalancer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Rebalance Interval: {}s", config.rebalance.interval_secs);
    info!(
        "   Drift Threshold: {}%",
        bps_to_percent(config.rebalance.threshold_bps.into())
    );
    info!("   Administrators: {}", config.access.admins.join(", "));
    for target in &config.simulation.targets {
        info!(
            "   Target [{}] {}: {}%",
            target.kind.short_code(),
            target.id,
            bps_to_percent(target.weight_bps.into())
        );
    }
}

async fn run_simulation(
    mut config: Config,
    cycles: Option<u32>,
    deposit: Option<u64>,
    start: Option<&str>,
    persist: bool,
    output_dir: Option<&str>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Capital Rebalancer v{} - Paper Simulation         ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    if let Some(cycles) = cycles {
        config.simulation.cycles = cycles;
    }
    if let Some(deposit) = deposit {
        config.simulation.initial_deposit = deposit;
    }
    log_config(&config);

    let start = match start {
        Some(s) => parse_start(s)?,
        None => Utc::now(),
    };

    let db_path = config.persistence.db_path.clone();
    let mut engine = SimulationEngine::new(config, start).await?;
    if persist {
        info!("💾 Persisting to {}", db_path);
        engine = engine.with_persistence(PersistenceManager::new(&db_path)?);
    }

    let result = engine.run().await?;
    println!("\n{}", result.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;

        let curve_path = format!("{}/value_curve.csv", dir);
        result.value_curve_to_csv(&curve_path)?;
        info!("📁 Value curve saved to: {}", curve_path);

        let result_path = format!("{}/simulation_result.json", dir);
        std::fs::write(&result_path, serde_json::to_string_pretty(&result)?)?;
        info!("📁 Results saved to: {}", result_path);
    }

    Ok(())
}

fn parse_start(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid start date '{}': {}", s, e))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow::anyhow!("Invalid start date '{}'", s))
}

/// Show the persisted portfolio state.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              PORTFOLIO STATUS                              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   Run `simulate --persist` first, or check the database path.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    let Some(snapshot) = persistence.load_snapshot()? else {
        println!("\n❌ No saved snapshot found in database.");
        return Ok(());
    };

    println!("\n📊 Portfolio Summary");
    println!("   ├─ Total Value:      {}", snapshot.total_value);
    println!("   ├─ Buffer:           {}", snapshot.buffer);
    println!(
        "   ├─ Allocated Weight: {}%",
        bps_to_percent(snapshot.total_weight_bps.into())
    );
    println!(
        "   ├─ Last Rebalance:   {}",
        snapshot
            .last_rebalance_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!("   └─ Saved At:         {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));

    println!("\n⚖️  Gate");
    println!("   ├─ Interval:         {}s", snapshot.rebalance_interval_secs);
    println!(
        "   └─ Drift Threshold:  {}%",
        bps_to_percent(snapshot.rebalance_threshold_bps.into())
    );

    if !snapshot.targets.is_empty() {
        println!("\n🎯 Targets");
        for target in &snapshot.targets {
            let value = target
                .value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unreadable".to_string());
            println!(
                "   ├─ #{} {:<20} {:>7}%  value {}",
                target.position,
                target.id,
                bps_to_percent(target.weight_bps.into()),
                value
            );
        }
    }

    if verbose {
        if !snapshot.retired.is_empty() {
            println!("\n📦 Retired Targets");
            for retired in &snapshot.retired {
                println!(
                    "   ├─ {} removed {} (drained {}, left behind {})",
                    retired.id,
                    retired.removed_at.format("%Y-%m-%d %H:%M"),
                    retired.drained,
                    retired.residual
                );
            }
        }

        let history = persistence.recent_rebalances(10)?;
        if !history.is_empty() {
            println!("\n🔁 Recent Rebalances");
            for record in &history {
                let outcome = match record.outcome {
                    RebalanceOutcome::Executed => "executed",
                    RebalanceOutcome::EmptyPortfolio => "empty",
                };
                println!(
                    "   ├─ {} {:<8} withdrawn {} allocated {} buffer {} (shortfalls {}, rejections {})",
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    outcome,
                    record.withdrawn,
                    record.allocated,
                    record.buffer_after,
                    record.shortfalls,
                    record.rejections
                );
            }
        }

        let counts = persistence.event_counts()?;
        if !counts.is_empty() {
            println!("\n🧾 Events");
            for (event_type, count) in &counts {
                println!("   ├─ {}: {}", event_type, count);
            }
        }
    }

    Ok(())
}

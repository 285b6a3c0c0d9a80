use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use lockscope::render;
use lockscope::simulate::{self, Simulation};
use lockscope_core::record::ProfilingWindow;
use lockscope_core::source::ReplaySource;
use lockscope_core::{Config, LockscopeEngine};

#[derive(Parser)]
#[command(name = "lockscope")]
#[command(about = "Sampling-based lock contention and deadlock analysis", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lockscope.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a recorded JSON-lines snapshot capture
    Analyze {
        /// Capture file, one thread snapshot per line
        #[arg(short, long)]
        input: PathBuf,
        /// Number of locks to report (0 = all)
        #[arg(long)]
        top_k: Option<usize>,
        /// Normalize against this window (ms from the first sample)
        #[arg(long)]
        window_ms: Option<u64>,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a simulated process with a hot lock and an optional deadlock
    Simulate {
        #[arg(long, default_value_t = 6)]
        workers: u64,
        /// Number of samples to take
        #[arg(long, default_value_t = 20)]
        cycles: u64,
        /// Simulated time between samples
        #[arg(long, default_value_t = 100)]
        step_ms: u64,
        /// Add two threads waiting on each other's lock
        #[arg(long)]
        deadlock: bool,
        /// Distribute snapshots through the streaming layer
        #[arg(long)]
        stream: bool,
        /// Consumer group size when streaming
        #[arg(long, default_value_t = 2)]
        consumers: usize,
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_target(config.logging.include_modules)
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        println!("{}", Config::default_toml()?);
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        eprintln!("📝 Loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    init_logging(&config);

    match cli.command {
        Commands::Analyze {
            input,
            top_k,
            window_ms,
            json,
        } => {
            if let Some(top_k) = top_k {
                config.analysis.top_k = top_k;
            }
            handle_analyze(config, &input, window_ms, json)?;
        }
        Commands::Simulate {
            workers,
            cycles,
            step_ms,
            deadlock,
            stream,
            consumers,
            json,
        } => {
            let simulation = Simulation {
                workers,
                cycles,
                step_ms,
                deadlock,
            };
            if stream {
                config.streaming.enabled = true;
                let outcome = simulate::run_streamed(&config, simulation, consumers).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                } else {
                    println!(
                        "📨 Streamed {} snapshots to {} consumers ({} dropped)",
                        outcome.producer.sent,
                        outcome.consumers.len(),
                        outcome.producer.dropped
                    );
                    print!("{}", render::render_records(&outcome.records));
                    println!();
                    print!(
                        "{}",
                        render::render_deadlocks(&outcome.deadlocks, &outcome.blocking_chains)
                    );
                }
            } else {
                let report = simulate::run_local(config, simulation).await?;
                print_report(&report, json)?;
            }
        }
        Commands::Config => {}
    }

    Ok(())
}

fn handle_analyze(config: Config, input: &Path, window_ms: Option<u64>, json: bool) -> Result<()> {
    let started = chrono::Utc::now();
    let source = ReplaySource::from_path(input)
        .with_context(|| format!("Failed to load capture {}", input.display()))?;

    let engine = LockscopeEngine::new(config);
    let snapshots = source.into_snapshots();
    tracing::info!("Analyzing {} snapshots from {}", snapshots.len(), input.display());
    engine.ingest_batch(snapshots);

    let window = window_ms.map(|ms| {
        let observed = engine.state().observed_window();
        ProfilingWindow::new(observed.start_ms, observed.start_ms.saturating_add(ms))
    });
    let report = engine.report(window);
    tracing::debug!(
        "Analysis took {} ms",
        (chrono::Utc::now() - started).num_milliseconds()
    );
    print_report(&report, json)
}

fn print_report(report: &lockscope_core::EngineReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render::render_report(report));
    }
    Ok(())
}

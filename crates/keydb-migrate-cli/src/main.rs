//! keydb-migrate CLI - key-by-key KeyDB/Redis migration and validation.

use clap::{Parser, Subcommand};
use keydb_migrate::error::EXIT_CANCELLED;
use keydb_migrate::{Config, MigrateError, MigrationResult, Orchestrator, ValidationReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "keydb-migrate")]
#[command(about = "Migrate and validate keys between two KeyDB/Redis instances")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Apply SOURCE_KEYDB_*, DEST_KEYDB_* and MIGRATION_* environment overrides
    /// (the config file becomes optional)
    #[arg(long)]
    env: bool,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Exit non-zero when any key fails, is skipped or does not validate
    #[arg(long)]
    strict: bool,

    /// Seconds to wait for in-flight work after a shutdown signal
    #[arg(long, default_value = "30")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every key from source to destination
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override SCAN page size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only migrate keys matching this SCAN pattern
        #[arg(long = "match")]
        match_pattern: Option<String>,

        /// Validate every key after the transfer
        #[arg(long)]
        validate: bool,
    },

    /// Compare every source key with its destination copy
    Validate {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Also compare remaining TTLs
        #[arg(long)]
        ttl: bool,
    },

    /// Test store connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = load_config(&cli.config, cli.env)?;
    if cli.strict {
        config.migration.strict = true;
    }

    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;

    match cli.command {
        Commands::Run {
            workers,
            batch_size,
            match_pattern,
            validate,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            if let Some(pattern) = match_pattern {
                config.migration.match_pattern = pattern;
            }
            if validate {
                config.migration.validate_after = true;
            }
            let config = config.with_auto_tuning();
            config.validate()?;

            let strict = config.migration.strict;
            let run_timeout = config.migration.run_timeout();
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.run(cancel_token).await;
            orchestrator.close().await?;
            let result = result?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_migration(&result);
            }

            match result.status.as_str() {
                "cancelled" => return Err(MigrateError::Cancelled),
                "timed_out" => {
                    return Err(MigrateError::Timeout {
                        operation: "migration run".to_string(),
                        after: run_timeout.unwrap_or_default(),
                    })
                }
                _ => {}
            }
            if strict {
                result.check_strict()?;
            }
        }

        Commands::Validate { workers, ttl } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if ttl {
                config.migration.validate_ttl = true;
            }
            let config = config.with_auto_tuning();
            config.validate()?;

            let strict = config.migration.strict;
            let orchestrator = Orchestrator::connect(config).await?;
            let report = orchestrator.validate(cancel_token).await;
            orchestrator.close().await?;
            let report = report?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation(&report);
            }

            if strict && !report.is_clean() {
                return Err(MigrateError::StrictModeFailure {
                    failed: 0,
                    skipped: 0,
                    mismatched: report.non_matching(),
                });
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    result.source_endpoint,
                    if result.source_error.is_none() { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Destination ({}): {} ({}ms)",
                    result.destination_endpoint,
                    if result.destination_error.is_none() { "OK" } else { "FAILED" },
                    result.destination_latency_ms
                );
                if let Some(ref err) = result.destination_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::connection(
                    "health-check",
                    "one or more stores did not answer PING",
                ));
            }
        }
    }

    Ok(())
}

/// Load the YAML file, layering environment overrides when `--env` is set.
///
/// With `--env` a missing file is not an error: configuration comes from the
/// environment alone.
fn load_config(path: &Path, env: bool) -> Result<Config, MigrateError> {
    if !env {
        let config = Config::load(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if path.exists() {
        let mut config = Config::load(path)?;
        config.apply_env()?;
        info!("Loaded configuration from {:?} with environment overrides", path);
        Ok(config)
    } else {
        info!("No configuration file at {:?}, using environment", path);
        Config::from_env()
    }
}

fn print_migration(result: &MigrationResult) {
    println!("\nMigration {}!", result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Keys: {} migrated, {} failed, {} skipped of {}",
        result.migrated_keys, result.failed_keys, result.skipped_keys, result.total_keys
    );
    println!("  Throughput: {:.0} keys/sec", result.keys_per_second);
    println!("  Success rate: {:.2}%", result.success_rate);
    for failure in &result.failures {
        println!("  Failed: {} ({})", failure.key, failure.reason);
    }
    if let Some(report) = &result.validation {
        print_validation(report);
    }
}

fn print_validation(report: &ValidationReport) {
    println!("\nValidation Summary:");
    println!("  Keys checked: {}", report.checked);
    println!("  Matched: {}", report.matched);
    println!("  Mismatched: {}", report.mismatched);
    println!("  Missing at destination: {}", report.missing_at_destination);
    println!("  Type mismatches: {}", report.type_mismatches);
    println!("  Missing at source: {}", report.missing_at_source);
    println!("  Errors: {}", report.errors);
    println!("  Duration: {:.2}s", report.duration_seconds);
    for sample in &report.samples {
        println!("  {} {}", sample.key, sample.verdict);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = verbosity.to_lowercase();
    if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
        return Err(format!("unknown verbosity '{}'", verbosity));
    }

    // RUST_LOG, when set, wins over --verbosity
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    // Logs go to stderr so --output-json leaves stdout parseable
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Exit hard if in-flight work has not drained `shutdown_timeout` seconds
/// after cancellation.
fn spawn_shutdown_deadline(token: CancellationToken, shutdown_timeout: u64) {
    tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        warn!(
            "In-flight work did not finish within {}s, exiting",
            shutdown_timeout
        );
        std::process::exit(EXIT_CANCELLED as i32);
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    Ok(cancel_token)
}

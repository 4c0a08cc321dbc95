//! Theraflow: identity-scoped patient and session cache
//!
//! Main binary with subcommands:
//! - `replay`: Run a JSON script against the in-memory store and print the cache

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use theraflow_store::{
    AuthState, Clinic, ClinicConfig, DEFAULT_CHANGE_CHANNEL_CAPACITY,
    DEFAULT_FAILURE_CHANNEL_CAPACITY, MemoryStore, RemoteStore,
};

mod script;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "theraflow")]
#[command(about = "Identity-scoped patient and session cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON script against the in-memory store
    Replay {
        /// Path to the script
        script: PathBuf,

        /// Put a record back into the cache when its remote delete fails.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "THERAFLOW_RESTORE_ON_FAILED_DELETE", value_parser = parse_bool_env, default_value = "false")]
        restore_on_failed_delete: bool,

        /// Capacity of the write failure channel
        #[arg(long, env = "THERAFLOW_FAILURE_CHANNEL_CAPACITY", default_value_t = DEFAULT_FAILURE_CHANNEL_CAPACITY)]
        failure_channel_capacity: usize,

        /// Capacity of the async change-event channel
        #[arg(long, env = "THERAFLOW_CHANGE_CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANGE_CHANNEL_CAPACITY)]
        change_channel_capacity: usize,

        /// Artificial latency of every remote operation, in milliseconds
        #[arg(long, env = "THERAFLOW_LATENCY_MS")]
        latency_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "theraflow=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            script,
            restore_on_failed_delete,
            failure_channel_capacity,
            change_channel_capacity,
            latency_ms,
        } => {
            let config = ClinicConfig {
                restore_on_failed_delete,
                failure_channel_capacity,
                change_channel_capacity,
            };
            run_replay(&script, config, latency_ms.map(Duration::from_millis)).await
        }
    }
}

async fn run_replay(path: &Path, config: ClinicConfig, latency: Option<Duration>) -> Result<()> {
    let steps = script::load(path).map_err(|e| miette::miette!("{}", e))?;
    info!(path = %path.display(), steps = steps.len(), "loaded script");

    let store = match latency {
        Some(latency) => MemoryStore::new().with_latency(latency),
        None => MemoryStore::new(),
    };
    let remote: Arc<dyn RemoteStore> = Arc::new(store);
    let clinic = Clinic::new(remote, config).map_err(|e| miette::miette!("{}", e))?;
    let auth = AuthState::new();
    let follower = clinic.follow_identity(&auth);

    let mut stdout = std::io::stdout().lock();
    let report = script::replay(&clinic, &auth, &steps, &mut stdout)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    drop(auth);
    if let Err(e) = follower.await {
        error!(error = %e, "identity follower task failed");
    }
    clinic.shutdown();

    if report.failed > 0 {
        return Err(miette::miette!(
            "{} of {} steps failed",
            report.failed,
            report.steps
        ));
    }
    Ok(())
}

use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use slotlock::config::Config;
use slotlock::kst::SystemClock;
use slotlock::maintenance;
use slotlock::store::LocalStore;
use slotlock::sync::{ScheduleSynchronizer, SyncPolicy};

const USAGE: &str = "usage: slotlock <verify|resync|compact>";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = std::env::args().nth(1) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(&command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{command} failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: &str) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let wal_path = config.wal_path();
    info!("slotlock {command}");
    info!("  wal: {}", wal_path.display());

    let store = Arc::new(LocalStore::open(&wal_path)?);
    match command {
        "verify" => {
            let report = maintenance::verify(&store).await;
            print_json(&report)?;
            Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        "resync" => {
            let sync = ScheduleSynchronizer::new(
                store.clone(),
                store.clone(),
                SyncPolicy::from_config(&config),
                Arc::new(SystemClock),
            );
            let report = maintenance::resync(&store, &sync).await;
            print_json(&report)?;
            Ok(if report.failures.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        "compact" => {
            let report = maintenance::compact(&store).await?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            eprintln!("{USAGE}");
            Ok(ExitCode::from(2))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

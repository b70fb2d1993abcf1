//! ferry - command-line client for the transfer engine.
//!
//! Moves files to and from a directory-backed object store in chunks, and
//! accepts pause/resume/cancel/status commands on stdin while a transfer
//! runs.

mod cli;
mod config;
mod console;

use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use ferry_engine::{TransferManager, Transport};
use ferry_fs_transport::LocalTransport;
use ferry_transfer::{TaskSpec, TaskState};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = Config::load(&config_path)?;
    args.apply_overrides(&mut config);

    // Initialize structured logging. Progress goes to stderr too, so stdout
    // only carries command results.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        config = %config_path.display(),
        bucket = %config.bucket_dir.display(),
        "ferry starting"
    );
    config.transfer.validate()?;

    let store = LocalTransport::new(&config.bucket_dir).with_verification(config.verify_checksums);

    match args.command {
        Command::Upload { local, key } => {
            run_transfer(store, &config, TaskSpec::upload(local, key)).await
        }
        Command::Download { key, local } => {
            run_transfer(store, &config, TaskSpec::download(key, local)).await
        }
        Command::Stat { key } => {
            let size = store.stat_object(&key).await?;
            let checksum = store.object_checksum(&key).await?;
            println!("{key}\t{size}\t{checksum}");
            Ok(())
        }
        Command::Config => {
            println!("# {}", config_path.display());
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Submits, starts and supervises one transfer until it is terminal.
async fn run_transfer(
    store: LocalTransport,
    config: &Config,
    spec: TaskSpec,
) -> anyhow::Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(store);
    let manager = TransferManager::new(transport, config.transfer.clone())?;

    let id = manager.submit(spec)?;
    manager.subscribe(id, console::progress_subscription())?;
    manager.start(id)?;
    eprintln!("task {id} started (commands: pause|p, resume|r, cancel|c, status|s)");

    let mut commands = console::spawn_stdin_reader()?;
    let snapshot = console::supervise(&manager, id, &mut commands).await?;

    match snapshot.state {
        TaskState::Completed => {
            println!("{}", console::status_line(&snapshot));
            Ok(())
        }
        TaskState::Cancelled => bail!("transfer {id} cancelled"),
        TaskState::Failed => bail!(
            "transfer {id} failed: {}",
            snapshot.error.unwrap_or_else(|| "unknown error".into())
        ),
        state => bail!("transfer {id} ended in unexpected state {state}"),
    }
}

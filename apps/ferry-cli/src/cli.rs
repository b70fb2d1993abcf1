use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// ferry - chunked uploads and downloads you can pause, resume and cancel
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version)]
#[command(about = "Move files to and from a local object store in resumable chunks")]
pub struct Cli {
    /// Configuration file (default: ~/.config/ferry/ferry.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Object store directory, overrides `bucket_dir`
    #[arg(long, global = true, value_name = "DIR")]
    pub bucket: Option<PathBuf>,

    /// Chunk size in bytes, overrides `transfer.chunk_size`
    #[arg(long, global = true, value_name = "BYTES")]
    pub chunk_size: Option<u64>,

    /// Concurrent chunks per transfer, overrides `transfer.workers`
    #[arg(long, global = true, value_name = "N")]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Upload a local file under KEY
    Upload {
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Download KEY to a local file
    Download {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
    },
    /// Print an object's size and SHA-256
    Stat {
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// Print the effective configuration
    Config,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded file.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(bucket) = &self.bucket {
            config.bucket_dir = bucket.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.transfer.chunk_size = chunk_size;
        }
        if let Some(workers) = self.workers {
            config.transfer.workers = workers;
        }
    }
}

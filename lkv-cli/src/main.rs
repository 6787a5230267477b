use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lkv_client::KVClient;
use lkv_common::Settings;

mod commands;

#[derive(Parser)]
#[command(
    name = "lkv",
    about = "Pooled store client and distributed lock tool",
    version,
    propagate_version = true
)]
struct Cli {
    /// JSON settings file; environment variables override its keys.
    #[arg(short, long, global = true, env = "LKV_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip a PING through the current pool
    Ping,
    /// Acquire a lock, optionally hold it, then release it
    Lock {
        /// Key guarded by the lock
        #[arg(short, long)]
        key: String,
        /// Owner id (default: a random UUID)
        #[arg(short, long)]
        owner: Option<String>,
        /// Give up after this long; 0 waits forever
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
        /// Keep renewing the lease while held
        #[arg(short, long)]
        fixed: bool,
        /// Hold the lock this long before releasing
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },
    /// Release a lock held by `owner`
    Unlock {
        #[arg(short, long)]
        key: String,
        #[arg(short, long)]
        owner: String,
    },
    /// Print the pool set as JSON
    Status,
}

fn main() -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new("info,lkv=debug"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let client = KVClient::connect(&settings).context("starting client")?;

    let result = match cli.command {
        Command::Ping => commands::ping(&client),
        Command::Lock {
            key,
            owner,
            timeout_ms,
            fixed,
            hold_ms,
        } => commands::lock(&client, &settings, &key, owner, timeout_ms, fixed, hold_ms),
        Command::Unlock { key, owner } => commands::unlock(&client, &settings, &key, &owner),
        Command::Status => commands::status(&client),
    };

    client.shutdown();
    result
}

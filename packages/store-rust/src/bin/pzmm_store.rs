//! `pzmm-store`: inspect and edit a mod manager store file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pzmm_core::StoreValue;
use pzmm_store::{init_tracing, JsonFileGateway, StoreConfig, StoreContext, DEFAULT_STORE_FILE_NAME};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding the store file.
    #[arg(long, env = "PZMM_STORE_DIR", default_value = ".")]
    dir: PathBuf,

    #[arg(long, env = "PZMM_STORE_FILE", default_value = DEFAULT_STORE_FILE_NAME)]
    file_name: String,

    /// Milliseconds between a write and the round that sends it.
    #[arg(long, env = "PZMM_FLUSH_DELAY_MS", default_value_t = 50)]
    flush_delay_ms: u64,

    /// Milliseconds between a successful write and the save to disk.
    #[arg(long, env = "PZMM_SAVE_DELAY_MS", default_value_t = 500)]
    save_delay_ms: u64,

    /// Upper bound in milliseconds for draining writes on exit.
    #[arg(long, env = "PZMM_TEARDOWN_TIMEOUT_MS", default_value_t = 2000)]
    teardown_timeout_ms: u64,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a value; parsed as JSON, or taken as a string if it is not JSON.
    Set { key: String, value: String },
    /// Exit with status 1 if the key is missing or null.
    Has { key: String },
    /// List keys holding a non-null value.
    Keys,
    /// Remove every key.
    Clear,
}

impl Cli {
    fn config(&self) -> StoreConfig {
        StoreConfig {
            flush_delay: Duration::from_millis(self.flush_delay_ms),
            save_delay: Duration::from_millis(self.save_delay_ms),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            store_file_name: self.file_name.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.config();
    let gateway = JsonFileGateway::open_in(&cli.dir, &config).await?;
    let ctx = StoreContext::new(Arc::new(gateway), config);

    let mut missing = false;
    match cli.command {
        Command::Get { key } => match ctx.get_value(&key).await {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => missing = true,
        },
        Command::Set { key, value } => {
            let value = serde_json::from_str::<StoreValue>(&value).unwrap_or(StoreValue::String(value));
            ctx.set_value(&key, value)
                .await
                .with_context(|| format!("writing {key}"))?;
        }
        Command::Has { key } => missing = !ctx.has(&key).await,
        Command::Keys => {
            for key in ctx.keys().await? {
                println!("{key}");
            }
        }
        Command::Clear => ctx.clear_all().await.context("clearing store")?,
    }

    if !ctx.shutdown().await {
        anyhow::bail!("timed out saving the store");
    }
    if missing {
        std::process::exit(1);
    }
    Ok(())
}

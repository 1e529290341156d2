use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ditto_imagegen::{
    BatchExecutor, EngineConfig, Env, InMemoryLedger, ProviderRegistry, Task,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "ditto-imagegen", about = "Run image generation batches")]
struct Cli {
    /// Engine config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dotenv file with provider credentials; the process environment is
    /// consulted after it.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch file against an in-memory ledger and print the report.
    Run {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, default_value = "local")]
        account: String,
        #[arg(long, default_value_t = 1000)]
        balance: u64,
        #[arg(long)]
        max_in_flight: Option<usize>,
    },
    /// List registered providers with their cost and capability.
    Providers,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Wrapped { tasks: Vec<Task> },
    Bare(Vec<Task>),
}

impl BatchFile {
    fn into_tasks(self) -> Vec<Task> {
        match self {
            Self::Wrapped { tasks } | Self::Bare(tasks) => tasks,
        }
    }
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    let env = match &cli.env_file {
        Some(path) => Env::from_dotenv_file(path).await?,
        None => Env::default(),
    };
    let registry = Arc::new(ProviderRegistry::from_config(&config, &env)?);

    match cli.command {
        Command::Providers => {
            let descriptors: Vec<_> = registry.descriptors().collect();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        Command::Run {
            tasks,
            account,
            balance,
            max_in_flight,
        } => {
            let raw = tokio::fs::read_to_string(&tasks)
                .await
                .map_err(|err| format!("failed to read {}: {err}", tasks.display()))?;
            let tasks = serde_json::from_str::<BatchFile>(&raw)?.into_tasks();

            let ledger = Arc::new(InMemoryLedger::with_account(account.clone(), balance));
            let mut executor = BatchExecutor::from_config(&config, registry, ledger);
            if let Some(max_in_flight) = max_in_flight {
                executor = executor.with_max_in_flight(max_in_flight);
            }

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling outstanding tasks");
                    on_ctrl_c.cancel();
                }
            });

            let report = executor.run_with_cancel(&account, tasks, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

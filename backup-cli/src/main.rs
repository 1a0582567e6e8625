mod config;
mod controller;
mod report;
mod state;

use anyhow::{Context, Result};
use backup_core::ttl::{format_partition_key, resolve_ttl_cutoff, PartitionScope};
use chrono::Local;
use clap::Parser;
use config::Config;
use std::path::PathBuf;

/// Backs up or restores partitioned table data between a ClickHouse cluster
/// and an S3-compatible object store.
#[derive(Parser, Debug)]
#[command(name = "cluster-backup", version)]
struct Cli {
    /// Partition key(s); comma-separated for multiple exact partitions.
    #[arg(short = 'p', long)]
    partition: Option<String>,

    /// TTL expression ("<n> D|W|M|Y"); implies cutoff mode over `--partition`.
    #[arg(long)]
    ttl: Option<String>,

    /// Run restore instead of backup.
    #[arg(long)]
    restore: bool,

    /// Path to the JSON configuration file.
    #[arg(long, default_value = "conf/backup.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let op_type = if cli.restore { "restore" } else { "backup" };
    let scope = resolve_partition_scope(&cli)?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from `{}`", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    tracing::info!(op_type, partitions = ?scope.partition_keys, "starting run");

    let resolved_scope = controller::resolve_scope(scope);
    let run_state = if cli.restore {
        controller::run_restore(&config, resolved_scope).await?
    } else {
        controller::run_backup(&config, resolved_scope).await?
    };

    let cwd = std::env::current_dir().context("reading current directory")?;
    let timestamp = Local::now().format("%Y%m%dT%H:%M:%S").to_string();
    let path = report::write_report(&cwd, op_type, &timestamp, &run_state)?;
    tracing::info!(path = %path.display(), "report written");

    if !run_state.failed().is_empty() {
        tracing::warn!(failed = run_state.failed().len(), "run completed with failures");
    }

    Ok(())
}

fn resolve_partition_scope(cli: &Cli) -> Result<PartitionScope> {
    if let Some(ttl) = &cli.ttl {
        let cutoff = resolve_ttl_cutoff(ttl, Local::now().date_naive())
            .map_err(|e| anyhow::anyhow!(e))?;
        return Ok(PartitionScope::Cutoff(cutoff));
    }
    if let Some(partition) = &cli.partition {
        return Ok(PartitionScope::exact_from_flag(partition));
    }
    Ok(PartitionScope::Exact(vec![format_partition_key(
        Local::now().date_naive(),
    )]))
}

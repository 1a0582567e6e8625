//! Standalone helper binary pushed to replica hosts and invoked over remote
//! shell by the backup orchestrator's fallback-upload phase (spec §4.14, §6).
//!
//! Contract: `s3uploader -b <remote-prefix> -f <local-path-or-csv> -a <key>
//! -s <secret> -r <region> -e <endpoint> [-d]`.

use anyhow::{Context, Result};
use backup_core::object_store::{ObjectStore, ObjectStoreOptions};
use clap::Parser;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "s3uploader")]
struct Cli {
    /// Remote key prefix to upload under.
    #[arg(short = 'b')]
    remote_prefix: String,

    /// Local path, or comma-separated list of local paths, to upload.
    #[arg(short = 'f')]
    folder: String,

    /// Access key.
    #[arg(short = 'a')]
    access_key: String,

    /// Secret key.
    #[arg(short = 's')]
    secret_key: String,

    /// Object store region.
    #[arg(short = 'r')]
    region: String,

    /// Object store endpoint.
    #[arg(short = 'e')]
    endpoint: String,

    /// Dry run: log what would be uploaded without writing any objects.
    #[arg(short = 'd', long = "dryrun")]
    dryrun: bool,

    /// Remove the remote prefix if the upload fails partway through.
    #[arg(long)]
    clean_if_fail: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli).await {
        tracing::error!(error = %err, "upload failed");
        if cli.clean_if_fail {
            if let Ok(store) = build_store(&cli).await {
                let _ = store.remove(&cli.remote_prefix).await;
            }
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let store = build_store(cli).await?;

    let paths: Vec<&str> = cli.folder.split(',').map(str::trim).collect();
    let mut uploaded = 0u64;
    for path in paths {
        let local = Path::new(path);
        uploaded += store
            .upload_walk(local, &cli.remote_prefix, cli.dryrun)
            .await
            .with_context(|| format!("uploading `{path}`"))?;
    }

    tracing::info!(bytes = uploaded, prefix = %cli.remote_prefix, "upload complete");
    Ok(())
}

async fn build_store(cli: &Cli) -> Result<ObjectStore> {
    let options = ObjectStoreOptions::from_endpoint(
        &cli.endpoint,
        cli.region.clone(),
        cli.access_key.clone(),
        cli.secret_key.clone(),
        true,
        8,
    )?;
    Ok(ObjectStore::new(options).await)
}

//! Backup orchestrator: the per-shard state machine
//! INIT → ARCHIVE → VERIFY_POST_ARCHIVE → (FALLBACK_UPLOAD → VERIFY_POST_UPLOAD) → DONE
//! (spec §4.5).

use crate::error::{BackupError, Result};
use crate::model::{BackupUnitId, CompressionMethod, VerifyMode};
use crate::object_store::ObjectStore;
use crate::parts;
use crate::pool::ClusterPool;
use crate::remote;
use crate::retry;
use std::path::PathBuf;
use std::time::Duration;

/// Static configuration for one backup unit's state machine run. Threaded
/// explicitly rather than read from shared config (Design Note on
/// process-wide singletons).
#[derive(Clone)]
pub struct BackupUnitConfig {
    pub data_path: String,
    pub compression: CompressionMethod,
    pub compression_level: u32,
    pub verify_mode: VerifyMode,
    pub upload_enabled: bool,
    pub clean_if_fail: bool,
    pub retry_attempts: u32,
    pub remote_shell_timeout: Duration,
    pub uploader_binary_local_path: PathBuf,
    /// Object-store credentials/endpoint, passed through to the `s3uploader`
    /// invocation in the fallback-upload phase (it has no other way to reach
    /// the object store — it runs on the replica host, not here).
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
}

/// Outcome of a single successfully-completed unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitResult {
    pub remote_bytes: u64,
    pub part_count: u64,
}

/// Runs the full retry-wrapped state machine for one `(database, table,
/// partition, shard_index)` unit, picking a live replica on `shard_index` for
/// every phase (a fresh pick per attempt, per [`ClusterPool::pick`]'s
/// no-caching contract).
pub async fn run_unit(
    pool: &ClusterPool,
    store: &ObjectStore,
    unit: &BackupUnitId,
    partition_predicate: &str,
    cfg: &BackupUnitConfig,
) -> Result<UnitResult> {
    let result = retry::with_retry(cfg.retry_attempts, |_try_no| {
        run_unit_once(pool, store, unit, partition_predicate, cfg)
    })
    .await;

    // Terminal rollback: retries exhausted with no recoverable path left.
    // Leave remote state in place unless the operator asked us to clean it.
    if result.is_err() && cfg.clean_if_fail {
        let prefix = unit.key_prefix();
        if let Err(cleanup_err) = store.remove(&prefix).await {
            tracing::error!(prefix, error = %cleanup_err, "terminal rollback failed");
        }
    }

    result
}

async fn run_unit_once(
    pool: &ClusterPool,
    store: &ObjectStore,
    unit: &BackupUnitId,
    partition_predicate: &str,
    cfg: &BackupUnitConfig,
) -> Result<UnitResult> {
    // INIT
    let parts = parts::discover_parts(
        pool,
        &unit.database,
        &unit.table,
        &cfg.data_path,
        partition_predicate,
        unit.shard_index,
        cfg.verify_mode,
    )
    .await?;
    if parts.is_empty() {
        return Ok(UnitResult {
            remote_bytes: 0,
            part_count: 0,
        });
    }

    let prefix = unit.key_prefix();
    let expected: std::collections::HashMap<String, _> = parts
        .iter()
        .map(|(name, descriptor)| (descriptor.remote_key(unit, name), descriptor.clone()))
        .collect();

    // ARCHIVE, with pre-archive verify for idempotent resumption.
    let pre_check = store.checksum(&prefix, &expected, cfg.verify_mode).await?;
    if !pre_check.is_clean() {
        archive_with_598_retry(pool, unit, partition_predicate, &prefix, cfg, store).await?;
    }

    // VERIFY_POST_ARCHIVE
    let mut report = store.checksum(&prefix, &expected, cfg.verify_mode).await?;

    if !report.is_clean() {
        if !cfg.upload_enabled {
            return Err(BackupError::VerificationMiss(report.missing_or_mismatched.len()));
        }
        fallback_upload(pool, unit, &parts, cfg).await?;
        report = store.checksum(&prefix, &expected, cfg.verify_mode).await?;
        if !report.is_clean() {
            return Err(BackupError::VerificationMiss(report.missing_or_mismatched.len()));
        }
    }

    Ok(UnitResult {
        remote_bytes: report.total_bytes,
        part_count: report.object_count,
    })
}

async fn archive_with_598_retry(
    pool: &ClusterPool,
    unit: &BackupUnitId,
    partition_predicate: &str,
    prefix: &str,
    cfg: &BackupUnitConfig,
    store: &ObjectStore,
) -> Result<()> {
    let mut already_cleaned = false;
    loop {
        match issue_archive(pool, unit, partition_predicate, prefix, cfg).await {
            Ok(()) => return Ok(()),
            Err(BackupError::ArchiveAlreadyExists(p)) => {
                if already_cleaned || !cfg.clean_if_fail {
                    return Err(BackupError::ArchiveAlreadyExists(p));
                }
                store.remove(prefix).await?;
                already_cleaned = true;
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

async fn issue_archive(
    pool: &ClusterPool,
    unit: &BackupUnitId,
    partition_predicate: &str,
    prefix: &str,
    cfg: &BackupUnitConfig,
) -> Result<()> {
    let handle = pool.pick(unit.shard_index).await?;
    let sql = format!(
        "ARCHIVE TABLE {}.{} PARTITION {} TO S3('{}/{}') SETTINGS compression_method = '{}', compression_level = {}",
        unit.database,
        unit.table,
        partition_predicate.trim_start_matches("= ").trim_start_matches("<= "),
        handle.replica.host,
        prefix,
        cfg.compression,
        cfg.compression_level,
    );
    handle
        .client
        .query(&sql)
        .execute()
        .await
        .map_err(|e| classify_clickhouse_error(&e, prefix))
}

fn classify_clickhouse_error(err: &clickhouse::error::Error, prefix: &str) -> BackupError {
    let message = err.to_string();
    if let Some(code) = parse_exception_code(&message) {
        if let Some(typed) = BackupError::from_exception_code(code, prefix, &message) {
            return typed;
        }
    }
    BackupError::TransientNetwork(anyhow::anyhow!(message))
}

/// ClickHouse server exceptions render as `"Code: <n>. DB::Exception: ..."`.
fn parse_exception_code(message: &str) -> Option<i32> {
    let after = message.strip_prefix("Code: ").or_else(|| {
        message.find("Code: ").map(|idx| &message[idx + "Code: ".len()..])
    })?;
    let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

async fn fallback_upload(
    pool: &ClusterPool,
    unit: &BackupUnitId,
    parts: &std::collections::HashMap<String, crate::model::PartDescriptor>,
    cfg: &BackupUnitConfig,
) -> Result<()> {
    let handle = pool.pick(unit.shard_index).await?;
    let remote_path = "/tmp/s3uploader";

    remote::push_file(&handle.replica, &cfg.uploader_binary_local_path, remote_path).await?;

    let s3_flags = format!(
        "-a '{}' -s '{}' -r '{}' -e '{}'",
        cfg.s3_access_key, cfg.s3_secret_key, cfg.s3_region, cfg.s3_endpoint
    );

    for (name, part) in parts {
        let remote_prefix = format!("{}/data/{}/{}/{}", unit.key_prefix(), unit.database, unit.table, name);
        let cmd = if cfg.verify_mode == VerifyMode::Count {
            // Per-file invocation: count-mode verifies file-for-file, so the
            // upload must produce one object per local file, not a directory put.
            format!(
                "for f in $(find '{}' -type f); do {remote_path} -b '{remote_prefix}' -f \"$f\" {s3_flags}; done",
                part.local_path
            )
        } else {
            format!(
                "{remote_path} -b '{remote_prefix}' -f '{}' {s3_flags}",
                part.local_path
            )
        };
        remote::run_command(&handle.replica, &cmd).await?;
    }

    remote::run_command(&handle.replica, &format!("rm -f {remote_path}"))
        .await
        .ok();
    let _ = cfg.remote_shell_timeout;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_clickhouse_exception_code() {
        let msg = "Code: 598. DB::Exception: Backup already exists. (BACKUP_ALREADY_EXISTS)";
        assert_eq!(parse_exception_code(msg), Some(598));
    }

    #[test]
    fn returns_none_for_non_exception_messages() {
        assert_eq!(parse_exception_code("connection refused"), None);
    }
}

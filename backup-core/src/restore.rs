//! Restore orchestrator: replays archives across replicas, tolerating
//! topology changes (spec §4.6).

use crate::error::{BackupError, Result};
use crate::model::BackupUnitId;
use crate::pool::ClusterPool;
use crate::retry;

/// Configuration for one restore unit run.
#[derive(Clone, Copy)]
pub struct RestoreUnitConfig {
    pub retry_attempts: u32,
    /// When set, a 599 on a replica the run already knew about (not newly
    /// added) is a hard failure rather than silently absorbed (spec §9).
    pub strict_restore: bool,
}

/// True if `host` was present in the topology at backup time (used to
/// distinguish a genuinely new replica from a known one under
/// `strict_restore`).
pub type KnownReplicaCheck<'a> = &'a dyn Fn(&str) -> bool;

pub async fn run_unit(
    pool: &ClusterPool,
    unit: &BackupUnitId,
    partition_predicate: &str,
    cfg: RestoreUnitConfig,
    known_replica: KnownReplicaCheck<'_>,
) -> Result<()> {
    retry::with_retry(cfg.retry_attempts, |_try_no| {
        run_unit_once(pool, unit, partition_predicate, cfg, known_replica)
    })
    .await
}

async fn run_unit_once(
    pool: &ClusterPool,
    unit: &BackupUnitId,
    partition_predicate: &str,
    cfg: RestoreUnitConfig,
    known_replica: KnownReplicaCheck<'_>,
) -> Result<()> {
    let handle = pool.pick(unit.shard_index).await?;
    let prefix = unit.key_prefix();
    let partition_literal = partition_predicate
        .trim_start_matches("= ")
        .trim_start_matches("<= ");

    let sql = format!(
        "RESTORE TABLE {}.{} PARTITION {} FROM S3('{}/{}') SETTINGS allow_non_empty_tables = true",
        unit.database, unit.table, partition_literal, handle.replica.host, prefix,
    );

    match handle.client.query(&sql).execute().await {
        Ok(()) => Ok(()),
        Err(err) => {
            let message = err.to_string();
            let code = message
                .strip_prefix("Code: ")
                .or_else(|| message.find("Code: ").map(|i| &message[i + 6..]))
                .and_then(|rest| rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<i32>().ok());

            match code {
                Some(599) => {
                    if cfg.strict_restore && known_replica(&handle.replica.host) {
                        Err(BackupError::RestoreMissingOnReplica(handle.replica.host.clone()))
                    } else {
                        tracing::info!(
                            host = %handle.replica.host,
                            "restore target absent on replica, treated as success"
                        );
                        Ok(())
                    }
                }
                Some(code) => Err(BackupError::from_exception_code(code, &prefix, &message)
                    .unwrap_or_else(|| BackupError::TransientNetwork(anyhow::anyhow!(message)))),
                None => Err(BackupError::TransientNetwork(anyhow::anyhow!(message))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_restore_defaults_are_wired() {
        let cfg = RestoreUnitConfig {
            retry_attempts: 2,
            strict_restore: false,
        };
        assert!(!cfg.strict_restore);
    }
}

//! Run controller: iterates tables × partitions, invokes the backup/restore
//! orchestrators, accumulates run state, and triggers source cleanup
//! (spec §4.7).

use crate::config::Config;
use crate::state::{RunState, TableState};
use anyhow::{Context, Result};
use backup_core::model::{BackupUnitId, CompressionMethod, Topology, VerifyMode};
use backup_core::object_store::{ObjectStore, ObjectStoreOptions};
use backup_core::orchestrator::{self, BackupUnitConfig};
use backup_core::parts;
use backup_core::pool::ClusterPool;
use backup_core::restore::{self, RestoreUnitConfig};
use backup_core::ttl::PartitionScope;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Partition scope plus whether each key is an exact match or a cutoff
/// (spec §4.8 — "TTL implies cutoff mode").
pub struct ResolvedScope {
    pub partition_keys: Vec<String>,
    pub cutoff: bool,
}

impl ResolvedScope {
    pub fn predicate_for(&self, key: &str) -> String {
        if self.cutoff {
            format!("<= '{key}'")
        } else {
            format!("= '{key}'")
        }
    }
}

pub fn resolve_scope(scope: PartitionScope) -> ResolvedScope {
    match scope {
        PartitionScope::Exact(keys) => ResolvedScope {
            partition_keys: keys,
            cutoff: false,
        },
        PartitionScope::Cutoff(key) => ResolvedScope {
            partition_keys: vec![key],
            cutoff: true,
        },
    }
}

fn verify_mode(config: &Config) -> VerifyMode {
    if config.s3.checksum {
        VerifyMode::Checksum
    } else if config.s3.check_cnt {
        VerifyMode::Count
    } else {
        VerifyMode::Existence
    }
}

fn verify_mode_compress_level_method(config: &Config) -> (u32, CompressionMethod) {
    (config.s3.compress_level, config.s3.compress_method)
}

pub async fn run_backup(config: &Config, scope: ResolvedScope) -> Result<RunState> {
    let topology = Topology::from_hosts(
        &config.clickhouse.hosts,
        &config.clickhouse.user,
        &config.clickhouse.password,
        &config.clickhouse.ssh_user,
        &config.clickhouse.ssh_password,
        config.clickhouse.ssh_port,
    );
    let pool = Arc::new(
        ClusterPool::connect(
            &topology,
            config.clickhouse.port,
            &config.clickhouse.database,
            Duration::from_secs(config.clickhouse.read_timeout_secs),
        )
        .await
        .context("connecting to cluster")?,
    );

    let store_options = ObjectStoreOptions::from_endpoint(
        &config.s3.endpoint,
        config.s3.region.clone(),
        config.s3.access_key.clone(),
        config.s3.secret_key.clone(),
        config.s3.use_path_style,
        8,
    )?;
    let store = ObjectStore::new(store_options).await;

    let (compress_level, compress_method) = verify_mode_compress_level_method(config);
    let unit_cfg = BackupUnitConfig {
        data_path: "/var/lib/clickhouse/data".to_string(),
        compression: compress_method,
        compression_level: compress_level,
        verify_mode: verify_mode(config),
        upload_enabled: config.s3.upload,
        clean_if_fail: config.s3.clean_if_fail,
        retry_attempts: config.s3.retry_times,
        remote_shell_timeout: Duration::from_secs(30),
        uploader_binary_local_path: PathBuf::from("bin/s3uploader"),
        s3_endpoint: config.s3.endpoint.clone(),
        s3_region: config.s3.region.clone(),
        s3_access_key: config.s3.access_key.clone(),
        s3_secret_key: config.s3.secret_key.clone(),
    };

    let mut run_state = RunState::default();
    for table in &config.clickhouse.tables {
        let mut table_state = TableState::new(format!("{}.{table}", config.clickhouse.database));
        let mut table_ok = true;
        let started = Instant::now();

        'partitions: for key in &scope.partition_keys {
            if !table_ok {
                break 'partitions;
            }
            let predicate = scope.predicate_for(key);

            // The shard is the unit of parallelism: every shard of this
            // partition is fanned out concurrently and joined at this
            // barrier before the next partition key is considered (spec §5).
            let mut joins = tokio::task::JoinSet::new();
            for shard in &topology.shards {
                let pool = Arc::clone(&pool);
                let store = store.clone();
                let unit_cfg = unit_cfg.clone();
                let predicate = predicate.clone();
                let unit = BackupUnitId {
                    database: config.clickhouse.database.clone(),
                    table: table.clone(),
                    partition: key.clone(),
                    shard_index: shard.index,
                    replica_host: shard
                        .replicas
                        .first()
                        .map(|r| r.host.clone())
                        .unwrap_or_default(),
                };
                joins.spawn(async move {
                    let result = orchestrator::run_unit(&pool, &store, &unit, &predicate, &unit_cfg).await;
                    (unit, result)
                });
            }

            let mut partition_remote_bytes = 0u64;
            let mut partition_failed = false;
            while let Some(joined) = joins.join_next().await {
                let (unit, result) = joined.context("backup shard task panicked")?;
                match result {
                    Ok(unit_result) => partition_remote_bytes += unit_result.remote_bytes,
                    Err(err) => {
                        tracing::error!(table, partition = %unit.partition, error = %err, "backup unit failed");
                        table_state.mark_failure(err.to_string());
                        partition_failed = true;
                    }
                }
            }

            if partition_failed {
                table_ok = false;
                continue;
            }

            let totals = parts::partition_totals(&pool, &config.clickhouse.database, table, &predicate)
                .await
                .context("summing partition totals")?;
            table_state.add_partition(
                totals.rows,
                totals.uncompressed_bytes,
                totals.compressed_bytes,
                partition_remote_bytes,
            );
        }

        table_state.record_elapsed(started.elapsed());
        if table_ok && config.clickhouse.clean {
            // Cleaning runs only after every partition of this table backed
            // up successfully — never after a failed partition (spec §4.5).
            for key in &scope.partition_keys {
                if let Err(err) = parts::drop_partition(&pool, &config.clickhouse.database, table, key).await {
                    tracing::error!(table, partition = %key, error = %err, "failed to drop source partition after backup");
                }
            }
            tracing::info!(table, "source partitions cleaned after successful backup");
        }
        run_state.tables.push(table_state);
    }

    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.close().await;
    }
    Ok(run_state)
}

pub async fn run_restore(config: &Config, scope: ResolvedScope) -> Result<RunState> {
    let topology = Topology::from_hosts(
        &config.clickhouse.hosts,
        &config.clickhouse.user,
        &config.clickhouse.password,
        &config.clickhouse.ssh_user,
        &config.clickhouse.ssh_password,
        config.clickhouse.ssh_port,
    );
    let pool = ClusterPool::connect(
        &topology,
        config.clickhouse.port,
        &config.clickhouse.database,
        Duration::from_secs(config.clickhouse.read_timeout_secs),
    )
    .await
    .context("connecting to cluster")?;

    let known_hosts: HashSet<String> = topology
        .shards
        .iter()
        .flat_map(|s| s.replicas.iter().map(|r| r.host.clone()))
        .collect();
    let known_replica = move |host: &str| known_hosts.contains(host);

    let restore_cfg = RestoreUnitConfig {
        retry_attempts: config.s3.retry_times,
        strict_restore: config.clickhouse.strict_restore,
    };

    let mut run_state = RunState::default();
    for table in &config.clickhouse.tables {
        let mut table_state = TableState::new(format!("{}.{table}", config.clickhouse.database));
        let started = Instant::now();

        for key in &scope.partition_keys {
            let predicate = scope.predicate_for(key);
            for shard in &topology.shards {
                let unit = BackupUnitId {
                    database: config.clickhouse.database.clone(),
                    table: table.clone(),
                    partition: key.clone(),
                    shard_index: shard.index,
                    replica_host: shard
                        .replicas
                        .first()
                        .map(|r| r.host.clone())
                        .unwrap_or_default(),
                };

                if let Err(err) =
                    restore::run_unit(&pool, &unit, &predicate, restore_cfg, &known_replica).await
                {
                    tracing::error!(table, partition = %key, error = %err, "restore unit failed");
                    table_state.mark_failure(err.to_string());
                }
            }
            table_state.partitions += 1;
        }

        table_state.record_elapsed(started.elapsed());
        run_state.tables.push(table_state);
    }

    pool.close().await;
    Ok(run_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_scope_uses_less_than_or_equal() {
        let scope = resolve_scope(PartitionScope::Cutoff("20240108".into()));
        assert_eq!(scope.predicate_for("20240108"), "<= '20240108'");
    }

    #[test]
    fn exact_scope_uses_equality() {
        let scope = resolve_scope(PartitionScope::Exact(vec!["20240115".into()]));
        assert_eq!(scope.predicate_for("20240115"), "= '20240115'");
    }
}

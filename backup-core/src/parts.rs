//! Part enumerator: partition row/byte aggregation and per-part path
//! discovery across shards (spec §4.4), grounded on the reference
//! `system.parts` scan and per-shard remote checksum/listing fan-out.

use crate::error::{BackupError, Result};
use crate::model::{PartDescriptor, VerifyMode};
use crate::pool::ClusterPool;
use crate::remote;
use clickhouse::Row;
use serde::Deserialize;
use std::collections::HashMap;

/// Rows/uncompressed/compressed bytes for one partition, summed over every
/// shard's picked replica. `op` in the original is `<=` for cutoff-based TTL
/// scopes and `=` for exact partitions; callers choose the comparison by
/// building the right `partition_predicate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionTotals {
    pub rows: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

#[derive(Row, Deserialize)]
struct TotalsRow {
    rows: u64,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

#[derive(Row, Deserialize)]
struct PartNameRow {
    name: String,
}

/// `partition_predicate` is a fragment like `= '20230731'` or `<= '20230731'`,
/// applied to `system.parts.partition_id`.
pub async fn partition_totals(
    pool: &ClusterPool,
    database: &str,
    table: &str,
    partition_predicate: &str,
) -> Result<PartitionTotals> {
    let sql = format!(
        "SELECT sum(rows) AS rows, \
                sum(bytes_on_disk) AS uncompressed_bytes, \
                sum(data_compressed_bytes) AS compressed_bytes \
         FROM system.parts \
         WHERE database = '{database}' AND table = '{table}' \
           AND active AND partition_id {partition_predicate}"
    );

    let mut totals = PartitionTotals::default();
    let shard_count = pool.shard_count().await;
    for shard_index in 0..shard_count {
        let handle = pool.pick(shard_index).await?;
        let row: TotalsRow = handle
            .client
            .query(&sql)
            .fetch_one()
            .await
            .map_err(|e| BackupError::TransientNetwork(e.into()))?;
        totals.rows += row.rows;
        totals.uncompressed_bytes += row.uncompressed_bytes;
        totals.compressed_bytes += row.compressed_bytes;
    }
    Ok(totals)
}

/// Lists every active part name for `database.table` under `partition_predicate`
/// on `shard_index`'s live replica, then, for each part, runs a remote
/// checksum (`md5sum`) or existence listing (`ls`) over SSH depending on
/// `mode`, building [`PartDescriptor`]s keyed by their local path.
pub async fn discover_parts(
    pool: &ClusterPool,
    database: &str,
    table: &str,
    data_path: &str,
    partition_predicate: &str,
    shard_index: usize,
    mode: VerifyMode,
) -> Result<HashMap<String, PartDescriptor>> {
    let handle = pool.pick(shard_index).await?;
    let sql = format!(
        "SELECT name FROM system.parts \
         WHERE database = '{database}' AND table = '{table}' \
           AND active AND partition_id {partition_predicate} \
         ORDER BY name"
    );
    let names: Vec<PartNameRow> = handle
        .client
        .query(&sql)
        .fetch_all()
        .await
        .map_err(|e| BackupError::TransientNetwork(e.into()))?;

    let mut parts = HashMap::with_capacity(names.len());
    for PartNameRow { name } in names {
        let local_path = format!("{data_path}/{database}/{table}/{name}");
        let descriptor = match mode {
            VerifyMode::Checksum => {
                let cmd = format!("find {local_path} -type f -exec md5sum {{}} + | md5sum");
                let out = remote::run_command(&handle.replica, &cmd).await?;
                let md5 = out.stdout.split_whitespace().next().map(str::to_string);
                PartDescriptor {
                    host: handle.replica.host.clone(),
                    local_path: local_path.clone(),
                    md5,
                    file_count: None,
                }
            }
            VerifyMode::Count => {
                let cmd = format!("find {local_path} -type f | wc -l");
                let out = remote::run_command(&handle.replica, &cmd).await?;
                let file_count = out.stdout.trim().parse().ok();
                PartDescriptor {
                    host: handle.replica.host.clone(),
                    local_path: local_path.clone(),
                    md5: None,
                    file_count,
                }
            }
            VerifyMode::Existence => PartDescriptor {
                host: handle.replica.host.clone(),
                local_path: local_path.clone(),
                md5: None,
                file_count: None,
            },
        };
        parts.insert(name, descriptor);
    }
    Ok(parts)
}

/// Drops `partition` from `database.table` on every shard's picked replica,
/// mirroring the reference `ch.Clean` (one `ALTER TABLE ... DROP PARTITION`
/// per shard, since each shard holds its own copy of the partition's parts).
/// Callers must only invoke this after every shard's backup for the table
/// succeeded (spec §4.5, "cleaning... never runs after a failed partition").
pub async fn drop_partition(pool: &ClusterPool, database: &str, table: &str, partition: &str) -> Result<()> {
    let sql = format!("ALTER TABLE `{database}`.`{table}` DROP PARTITION '{partition}'");
    let shard_count = pool.shard_count().await;
    for shard_index in 0..shard_count {
        let handle = pool.pick(shard_index).await?;
        handle
            .client
            .query(&sql)
            .execute()
            .await
            .map_err(|e| BackupError::TransientNetwork(e.into()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_totals_default_is_zero() {
        let totals = PartitionTotals::default();
        assert_eq!(totals.rows, 0);
        assert_eq!(totals.uncompressed_bytes, 0);
        assert_eq!(totals.compressed_bytes, 0);
    }
}

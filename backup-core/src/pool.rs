//! Cluster connection pool: per-shard replica connections and liveness probing (spec §4.1).

use crate::error::{BackupError, Result};
use crate::model::{Replica, Topology};
use std::time::Duration;
use tokio::sync::Mutex;

/// One live handle to a replica: a client plus the remote-shell principal
/// needed later by the orchestrator's fallback-upload phase.
#[derive(Clone)]
pub struct ReplicaHandle {
    pub replica: Replica,
    pub client: clickhouse::Client,
}

struct ShardConns {
    handles: Vec<ReplicaHandle>,
}

/// Holds one connection per replica, LZ4-compressed, opened once at run start
/// and released at [`ClusterPool::close`]. Read-only after [`ClusterPool::connect`]
/// returns (Design Note: "connection pool is read-only after connect returns").
pub struct ClusterPool {
    shards: Mutex<Vec<ShardConns>>,
}

impl ClusterPool {
    /// Opens one connection per replica. Proceeds even if some replicas in a
    /// shard fail to open, but fails the whole connect if *every* replica of
    /// some shard fails (a shard with zero live replicas cannot be backed up).
    pub async fn connect(
        topology: &Topology,
        port: u16,
        database: &str,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut shards = Vec::with_capacity(topology.shards.len());
        let mut last_err: Option<BackupError> = None;

        for shard in &topology.shards {
            let mut handles = Vec::new();
            for replica in &shard.replicas {
                match open_replica(replica, port, database, read_timeout).await {
                    Ok(client) => handles.push(ReplicaHandle {
                        replica: replica.clone(),
                        client,
                    }),
                    Err(err) => {
                        tracing::error!(host = %replica.host, error = %err, "connect failed");
                        last_err = Some(err);
                    }
                }
            }
            if handles.is_empty() {
                return Err(last_err.unwrap_or_else(|| {
                    BackupError::Config(format!("shard {} has no reachable replicas", shard.index))
                }));
            }
            shards.push(ShardConns { handles });
        }

        Ok(ClusterPool {
            shards: Mutex::new(shards),
        })
    }

    /// Probes replicas of `shard_index` in listed order with a cheap round
    /// trip, returning the first whose probe succeeds. Never caches
    /// liveness across calls (Contract in §4.1).
    pub async fn pick(&self, shard_index: usize) -> Result<ReplicaHandle> {
        let shards = self.shards.lock().await;
        let shard = shards
            .get(shard_index)
            .ok_or(BackupError::NoLiveReplica(shard_index))?;

        for handle in &shard.handles {
            match handle.client.query("SELECT 1").execute().await {
                Ok(()) => return Ok(handle.clone()),
                Err(err) => {
                    tracing::debug!(host = %handle.replica.host, error = %err, "probe failed");
                }
            }
        }
        Err(BackupError::NoLiveReplica(shard_index))
    }

    pub async fn shard_count(&self) -> usize {
        self.shards.lock().await.len()
    }

    /// Drops every held client. Plain `Drop` would do the same, but this
    /// keeps the scoped-teardown boundary explicit at the call site.
    pub async fn close(self) {
        drop(self.shards.into_inner());
    }
}

async fn open_replica(
    replica: &Replica,
    port: u16,
    database: &str,
    read_timeout: Duration,
) -> Result<clickhouse::Client> {
    let url = format!("http://{}:{port}", replica.host);
    let client = clickhouse::Client::default()
        .with_url(url)
        .with_user(&replica.db_user)
        .with_password(&replica.db_password)
        .with_database(database)
        .with_option("max_execution_time", "0");

    tokio::time::timeout(read_timeout, client.query("SELECT 1").execute())
        .await
        .map_err(|_| {
            BackupError::TransientNetwork(anyhow::anyhow!(
                "connect to {} timed out after {:?}",
                replica.host,
                read_timeout
            ))
        })?
        .map_err(|e| BackupError::TransientNetwork(e.into()))?;

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;

    #[tokio::test]
    async fn pick_fails_with_no_live_replica_for_unknown_shard() {
        let topology = Topology { shards: vec![] };
        let pool = ClusterPool {
            shards: Mutex::new(vec![]),
        };
        let _ = topology;
        let err = pool.pick(0).await.unwrap_err();
        assert!(matches!(err, BackupError::NoLiveReplica(0)));
    }
}

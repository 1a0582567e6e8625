//! Cluster topology and backup-unit data model (spec §3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// One database-protocol + remote-shell endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub host: String,
    pub db_user: String,
    pub db_password: String,
    pub ssh_user: String,
    pub ssh_password: String,
    pub ssh_port: u16,
}

/// A shard is a non-empty ordered sequence of replicas; the shard index is
/// stable for the lifetime of a run (spec §3 invariant).
#[derive(Debug, Clone)]
pub struct Shard {
    pub index: usize,
    pub replicas: Vec<Replica>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub shards: Vec<Shard>,
}

impl Topology {
    pub fn from_hosts(
        hosts: &[Vec<String>],
        db_user: &str,
        db_password: &str,
        ssh_user: &str,
        ssh_password: &str,
        ssh_port: u16,
    ) -> Self {
        let shards = hosts
            .iter()
            .enumerate()
            .map(|(index, replicas)| Shard {
                index,
                replicas: replicas
                    .iter()
                    .map(|host| Replica {
                        host: host.clone(),
                        db_user: db_user.to_string(),
                        db_password: db_password.to_string(),
                        ssh_user: ssh_user.to_string(),
                        ssh_password: ssh_password.to_string(),
                        ssh_port,
                    })
                    .collect(),
            })
            .collect();
        Topology { shards }
    }
}

/// Verification strategy configured for a run (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Compare remote object MD5 against the expected local checksum.
    Checksum,
    /// Compare per-part remote object counts against local file counts.
    Count,
    /// Only check that an object exists under the expected key.
    #[default]
    Existence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Lz4,
    Lz4Hc,
    Zstd,
    DeflateQpl,
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Lz4
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Lz4Hc => "lz4hc",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::DeflateQpl => "deflate_qpl",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lz4" => Ok(CompressionMethod::Lz4),
            "lz4hc" => Ok(CompressionMethod::Lz4Hc),
            "zstd" => Ok(CompressionMethod::Zstd),
            "deflate_qpl" => Ok(CompressionMethod::DeflateQpl),
            other => Err(format!("unknown compression method: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for CompressionMethod {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for CompressionMethod {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A backup unit is identified by `(database, table, partition, shard_index, replica_host)`.
/// Its canonical key prefix is a pure function of this tuple (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupUnitId {
    pub database: String,
    pub table: String,
    pub partition: String,
    pub shard_index: usize,
    pub replica_host: String,
}

impl BackupUnitId {
    /// `"<partition>/<database>.<table>/<replica_host>"` — exactly, no other path may appear.
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/{}.{}/{}",
            self.partition, self.database, self.table, self.replica_host
        )
    }
}

/// One on-disk data part belonging to a backup unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub host: String,
    pub local_path: String,
    pub md5: Option<String>,
    pub file_count: Option<u64>,
}

impl PartDescriptor {
    /// `"<partition>/<database>.<table>/<replica_host>/data/<database>/<table>/<part_name>"`.
    pub fn remote_key(&self, unit: &BackupUnitId, part_name: &str) -> String {
        format!(
            "{}/data/{}/{}/{}",
            unit.key_prefix(),
            unit.database,
            unit.table,
            part_name
        )
    }
}

/// Terminal outcome of one (database, table) aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("SUCCESS"),
            Outcome::Failure => f.write_str("FAILURE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_is_pure_function_of_tuple() {
        let a = BackupUnitId {
            database: "default".into(),
            table: "t".into(),
            partition: "20230731".into(),
            shard_index: 0,
            replica_host: "h1".into(),
        };
        let b = a.clone();
        assert_eq!(a.key_prefix(), b.key_prefix());
        assert_eq!(a.key_prefix(), "20230731/default.t/h1");
    }

    #[test]
    fn distinct_tuples_never_share_a_prefix() {
        let a = BackupUnitId {
            database: "default".into(),
            table: "t".into(),
            partition: "20230731".into(),
            shard_index: 0,
            replica_host: "h1".into(),
        };
        let mut b = a.clone();
        b.replica_host = "h2".into();
        assert_ne!(a.key_prefix(), b.key_prefix());
    }

    #[test]
    fn part_remote_key_is_nested_under_unit_prefix() {
        let unit = BackupUnitId {
            database: "default".into(),
            table: "t".into(),
            partition: "20230731".into(),
            shard_index: 0,
            replica_host: "h1".into(),
        };
        let part = PartDescriptor {
            host: "h1".into(),
            local_path: "/data/store/t/20230731_0_0_0".into(),
            md5: None,
            file_count: None,
        };
        let key = part.remote_key(&unit, "20230731_0_0_0");
        assert_eq!(key, "20230731/default.t/h1/data/default/t/20230731_0_0_0");
        assert!(key.starts_with(&unit.key_prefix()));
    }
}

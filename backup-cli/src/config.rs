//! Typed JSON configuration with the reference implementation's defaults
//! expressed as `Default` impls (spec §4.10, §6).

use anyhow::{bail, Context, Result};
use backup_core::CompressionMethod;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "ClickHouse")]
    pub clickhouse: ClickHouseConfig,
    #[serde(rename = "S3")]
    pub s3: S3Config,
    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(rename = "Hosts")]
    pub hosts: Vec<Vec<String>>,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    #[serde(rename = "User", default = "default_user")]
    pub user: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "Database", default = "default_database")]
    pub database: String,
    #[serde(rename = "Tables")]
    pub tables: Vec<String>,
    #[serde(rename = "Clean", default = "default_true")]
    pub clean: bool,
    #[serde(rename = "ReadTimeout", default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(rename = "SshUser")]
    pub ssh_user: String,
    #[serde(rename = "SshPassword", default)]
    pub ssh_password: String,
    #[serde(rename = "SshPort", default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(rename = "StrictRestore", default)]
    pub strict_restore: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "AccessKey")]
    pub access_key: String,
    #[serde(rename = "SecretKey")]
    pub secret_key: String,
    #[serde(rename = "CompressMethod", default)]
    pub compress_method: CompressionMethod,
    #[serde(rename = "CompressLevel", default = "default_compress_level")]
    pub compress_level: u32,
    #[serde(rename = "RetryTimes", default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(rename = "CleanIfFail", default)]
    pub clean_if_fail: bool,
    #[serde(rename = "UsePathStyle", default = "default_true")]
    pub use_path_style: bool,
    #[serde(rename = "CheckSum", default)]
    pub checksum: bool,
    #[serde(rename = "CheckCnt", default)]
    pub check_cnt: bool,
    #[serde(rename = "Upload", default)]
    pub upload: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_user() -> String {
    "default".to_string()
}
fn default_database() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}
fn default_read_timeout() -> u64 {
    21600
}
fn default_ssh_port() -> u16 {
    22
}
fn default_compress_level() -> u32 {
    3
}
fn default_retry_times() -> u32 {
    1
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file `{}`", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing configuration file `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.s3.region.is_empty() {
            bail!("S3.Region must not be empty");
        }
        if self.s3.endpoint.is_empty() {
            bail!("S3.Endpoint must not be empty");
        }
        if self.clickhouse.hosts.is_empty() {
            bail!("ClickHouse.Hosts must list at least one shard");
        }
        for (idx, shard) in self.clickhouse.hosts.iter().enumerate() {
            if shard.is_empty() {
                bail!("ClickHouse.Hosts[{idx}] has no replicas");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_implementation() {
        let json = r#"{
            "ClickHouse": {
                "Cluster": "c1",
                "Hosts": [["h1", "h2"], ["h3"]],
                "Tables": ["t1"],
                "SshUser": "clickhouse"
            },
            "S3": {
                "Endpoint": "http://minio:9000/backup",
                "Region": "us-east-1",
                "AccessKey": "ak",
                "SecretKey": "sk"
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.clickhouse.port, 9000);
        assert_eq!(config.clickhouse.user, "default");
        assert_eq!(config.clickhouse.database, "default");
        assert!(config.clickhouse.clean);
        assert_eq!(config.clickhouse.read_timeout_secs, 21600);
        assert_eq!(config.clickhouse.ssh_port, 22);
        assert!(!config.clickhouse.strict_restore);
        assert_eq!(config.s3.compress_level, 3);
        assert_eq!(config.s3.retry_times, 1);
        assert!(config.s3.use_path_style);
        assert!(!config.s3.checksum);
        assert!(!config.s3.upload);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.s3.compress_method, CompressionMethod::Lz4);
    }

    #[test]
    fn load_reads_and_validates_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        std::fs::write(
            &path,
            r#"{
                "ClickHouse": {"Cluster": "c1", "Hosts": [["h1"]], "Tables": ["t1"], "SshUser": "root"},
                "S3": {"Endpoint": "http://minio:9000/backup", "Region": "us-east-1", "AccessKey": "a", "SecretKey": "b"}
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.clickhouse.cluster, "c1");
    }

    #[test]
    fn rejects_empty_region() {
        let json = r#"{
            "ClickHouse": {"Cluster": "c1", "Hosts": [["h1"]], "Tables": ["t1"], "SshUser": "root"},
            "S3": {"Endpoint": "http://minio:9000/backup", "Region": "", "AccessKey": "a", "SecretKey": "b"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}

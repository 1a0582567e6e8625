//! Object store adapter: list/delete/head/put, checksum verification including
//! multipart ETag reconstruction, and directory walk-upload (spec §4.3).

use crate::error::{BackupError, Result};
use crate::model::{PartDescriptor, VerifyMode};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// 32 MiB — the chunk size used to stream a multipart object's body while
/// reconstructing its canonical MD5 (spec §4.3).
const MULTIPART_STREAM_CHUNK: usize = 32 * 1024 * 1024;

/// S3-compatible object store options, derived from the `S3` configuration
/// block (spec §6). Mirrors `bottomless::replicator::s3::S3Options`.
#[derive(Clone, Debug)]
pub struct ObjectStoreOptions {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub use_path_style: bool,
    pub upload_max_parallelism: usize,
}

impl ObjectStoreOptions {
    /// If the endpoint URL carries a path segment, the first path segment is
    /// the bucket name and is stripped from the endpoint (spec §4.3, §6).
    pub fn from_endpoint(
        endpoint: &str,
        region: String,
        access_key: String,
        secret_key: String,
        use_path_style: bool,
        upload_max_parallelism: usize,
    ) -> Result<Self> {
        let url = url_parse(endpoint)?;
        let (base_endpoint, bucket) = match url.path_segment {
            Some(seg) if !seg.is_empty() => (url.scheme_and_host, seg),
            _ => (endpoint.to_string(), String::new()),
        };

        if bucket.is_empty() || region.is_empty() {
            return Err(BackupError::Config(
                "bucket and region must not be empty".into(),
            ));
        }

        Ok(ObjectStoreOptions {
            endpoint: base_endpoint,
            region,
            access_key,
            secret_key,
            bucket,
            use_path_style,
            upload_max_parallelism,
        })
    }

    pub async fn client_config(&self) -> Config {
        let loader = aws_config::from_env().endpoint_url(&self.endpoint);
        aws_sdk_s3::config::Builder::from(&loader.load().await)
            .region(Region::new(self.region.clone()))
            .credentials_provider(Credentials::new(
                &self.access_key,
                &self.secret_key,
                None,
                None,
                "static",
            ))
            .force_path_style(self.use_path_style)
            .build()
    }
}

struct ParsedUrl {
    scheme_and_host: String,
    path_segment: Option<String>,
}

fn url_parse(endpoint: &str) -> Result<ParsedUrl> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| BackupError::Config(format!("invalid endpoint url: `{endpoint}`")))?;
    match rest.split_once('/') {
        Some((host, path)) => {
            let first_segment = path.split('/').find(|s| !s.is_empty());
            Ok(ParsedUrl {
                scheme_and_host: format!("{scheme}://{host}"),
                path_segment: first_segment.map(|s| s.to_string()),
            })
        }
        None => Ok(ParsedUrl {
            scheme_and_host: endpoint.to_string(),
            path_segment: None,
        }),
    }
}

/// A `Clone`-able handle to the object store — explicitly threaded through
/// every component that needs it (Design Note: no process-wide singleton).
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    options: ObjectStoreOptions,
}

/// Outcome of [`ObjectStore::checksum`].
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub missing_or_mismatched: Vec<String>,
    pub total_bytes: u64,
    pub object_count: u64,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing_or_mismatched.is_empty()
    }
}

impl ObjectStore {
    pub async fn new(options: ObjectStoreOptions) -> Self {
        let client = Client::from_conf(options.client_config().await);
        ObjectStore { client, options }
    }

    pub fn bucket(&self) -> &str {
        &self.options.bucket
    }

    /// Lists then deletes every object under `prefix`, repeating list+delete
    /// until the listing is empty (list pages are bounded at 1000 entries),
    /// then waits for a HEAD on each deleted key to return not-found — a
    /// strong deletion barrier (spec §4.3, invariant 3).
    pub async fn remove(&self, prefix: &str) -> Result<()> {
        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(self.bucket())
                .prefix(prefix)
                .send()
                .await
                .map_err(|e| BackupError::TransientNetwork(e.into()))?;

            let keys: Vec<String> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect();

            if keys.is_empty() {
                break;
            }
            if listing.is_truncated().unwrap_or(false) {
                tracing::warn!(prefix, "object list page hit the maximum size during removal");
            }

            for key in &keys {
                self.client
                    .delete_object()
                    .bucket(self.bucket())
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| BackupError::TransientNetwork(e.into()))?;
                self.wait_until_absent(key).await?;
            }
        }
        Ok(())
    }

    async fn wait_until_absent(&self, key: &str) -> Result<()> {
        for _ in 0..20 {
            match self
                .client
                .head_object()
                .bucket(self.bucket())
                .key(key)
                .send()
                .await
            {
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
                Err(_) => return Ok(()),
            }
        }
        Err(BackupError::Other(anyhow::anyhow!(
            "key `{key}` still visible after delete barrier wait"
        )))
    }

    /// Lists all objects under `prefix`, computing a canonical MD5 for each
    /// (reconstructing it via streamed hashing if the ETag indicates a
    /// multipart upload), then reports which expected parts are missing or
    /// mismatched according to `mode` (spec §4.3, invariants 4–5).
    pub async fn checksum(
        &self,
        prefix: &str,
        expected: &HashMap<String, PartDescriptor>,
        mode: VerifyMode,
    ) -> Result<VerifyReport> {
        let mut remote: HashMap<String, (u64, String)> = HashMap::new();
        let mut continuation_token = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(self.bucket())
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let page = req
                .send()
                .await
                .map_err(|e| BackupError::TransientNetwork(e.into()))?;

            if page.is_truncated().unwrap_or(false) && page.next_continuation_token().is_none() {
                return Err(BackupError::ObjectStoreListBounded(prefix.to_string()));
            }

            for obj in page.contents() {
                let key = match obj.key() {
                    Some(k) => k.to_string(),
                    None => continue,
                };
                let size = obj.size().unwrap_or(0).max(0) as u64;
                let etag = obj.e_tag().unwrap_or("").trim_matches('"').to_string();
                let md5 = if etag.contains('-') {
                    self.multipart_md5(&key).await?
                } else {
                    etag
                };
                remote.insert(key, (size, md5));
            }

            continuation_token = page.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        }

        let mut report = VerifyReport::default();
        for (key, part) in expected {
            match mode {
                VerifyMode::Existence => {
                    if !remote.contains_key(key) {
                        report.missing_or_mismatched.push(key.clone());
                    }
                }
                VerifyMode::Checksum => match (remote.get(key), &part.md5) {
                    (Some((_, actual)), Some(expected_md5)) if actual == expected_md5 => {}
                    (Some(_), None) => {}
                    _ => report.missing_or_mismatched.push(key.clone()),
                },
                VerifyMode::Count => {
                    // Count-mode uploads write one remote object per local file
                    // under the part's prefix, so `key` is a directory, not an
                    // object itself — compare how many remote keys fall under it
                    // against the file count observed on the replica.
                    let expected_count = part.file_count.unwrap_or(0);
                    let actual_count = remote.keys().filter(|k| k.starts_with(key.as_str())).count() as u64;
                    if actual_count != expected_count {
                        report.missing_or_mismatched.push(key.clone());
                    }
                }
            }
        }

        for (size, _) in remote.values() {
            report.total_bytes += size;
        }
        report.object_count = remote.len() as u64;

        Ok(report)
    }

    /// Streams a multipart object's body in fixed-size chunks and computes
    /// MD5 over the bytes, since a multipart ETag is not the object's MD5
    /// (spec §4.3, invariant 5).
    async fn multipart_md5(&self, key: &str) -> Result<String> {
        let mut resp = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::TransientNetwork(e.into()))?
            .body
            .into_async_read();

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; MULTIPART_STREAM_CHUNK];
        loop {
            let n = resp
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Other(e.into()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Recursively walks `local_dir` and puts each file under
    /// `<remote_prefix>/<basename>` using a bounded worker pool; aborts and
    /// returns the first error observed (spec §4.3).
    pub async fn upload_walk(&self, local_dir: &Path, remote_prefix: &str, dryrun: bool) -> Result<u64> {
        let entries: Vec<_> = walkdir::WalkDir::new(local_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();

        let mut uploaded_bytes = 0u64;
        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = entries.into_iter();
        let parallelism = self.options.upload_max_parallelism.max(1);

        for _ in 0..parallelism {
            if let Some(entry) = pending.next() {
                self.spawn_put(&mut join_set, entry, remote_prefix, dryrun);
            }
        }

        while let Some(result) = join_set.join_next().await {
            let bytes = result
                .map_err(|e| BackupError::Other(e.into()))??;
            uploaded_bytes += bytes;
            if let Some(entry) = pending.next() {
                self.spawn_put(&mut join_set, entry, remote_prefix, dryrun);
            }
        }

        Ok(uploaded_bytes)
    }

    fn spawn_put(
        &self,
        join_set: &mut tokio::task::JoinSet<Result<u64>>,
        entry: walkdir::DirEntry,
        remote_prefix: &str,
        dryrun: bool,
    ) {
        let store = self.clone();
        let remote_prefix = remote_prefix.to_string();
        join_set.spawn(async move {
            let path = entry.path().to_path_buf();
            let basename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("part")
                .to_string();
            let key = format!("{remote_prefix}/{basename}");
            let bytes = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if dryrun {
                tracing::info!(key, bytes, "dry-run: would upload");
                return Ok(bytes);
            }
            let body = ByteStream::from_path(&path)
                .await
                .map_err(|e| BackupError::Other(e.into()))?;
            store
                .client
                .put_object()
                .bucket(store.bucket())
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| BackupError::TransientNetwork(e.into()))?;
            Ok(bytes)
        });
    }

    /// Uploads a single in-memory buffer directly (used by `s3uploader` when
    /// invoked with an explicit file list rather than a directory).
    pub async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| BackupError::TransientNetwork(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_with_path_splits_bucket() {
        let opts = ObjectStoreOptions::from_endpoint(
            "http://192.168.101.94:49000/backup",
            "us-east-1".into(),
            "ak".into(),
            "sk".into(),
            true,
            8,
        )
        .unwrap();
        assert_eq!(opts.endpoint, "http://192.168.101.94:49000");
        assert_eq!(opts.bucket, "backup");
    }

    #[test]
    fn endpoint_without_path_requires_explicit_bucket_elsewhere() {
        let err = ObjectStoreOptions::from_endpoint(
            "http://192.168.101.94:49000",
            "us-east-1".into(),
            "ak".into(),
            "sk".into(),
            true,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn empty_region_is_a_config_error() {
        let err = ObjectStoreOptions::from_endpoint(
            "http://host:9000/bucket",
            "".into(),
            "ak".into(),
            "sk".into(),
            true,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }
}

use thiserror::Error;

/// Error kinds the orchestrator distinguishes (spec §7).
///
/// Call sites match on variants instead of string-sniffing driver errors;
/// the CLI wraps this in `anyhow` at its own boundary.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient network error: {0}")]
    TransientNetwork(#[source] anyhow::Error),

    #[error("no live replica responded to probe for shard {0}")]
    NoLiveReplica(usize),

    #[error("remote authentication failed on {host}: {source}")]
    RemoteAuthFail {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote transport failure on {host}: {source}")]
    RemoteTransportFail {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote command `{command}` on {host} exited with status {status}: {stderr}")]
    RemoteNonZeroExit {
        host: String,
        command: String,
        status: i32,
        stderr: String,
    },

    /// ClickHouse error code 598: "backup already exists".
    #[error("archive already exists at prefix `{0}`")]
    ArchiveAlreadyExists(String),

    /// ClickHouse error code 599 during restore: the replica has no archive.
    #[error("no archive present for replica {0} (topology changed)")]
    RestoreMissingOnReplica(String),

    #[error("verification reported {0} missing or mismatched object(s)")]
    VerificationMiss(usize),

    #[error("object store list page hit the maximum size under prefix `{0}`; results may be incomplete")]
    ObjectStoreListBounded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackupError {
    /// Errors the retry loop should keep retrying rather than give up on immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupError::TransientNetwork(_)
                | BackupError::RemoteTransportFail { .. }
                | BackupError::RemoteNonZeroExit { .. }
                | BackupError::RemoteAuthFail { .. }
                | BackupError::VerificationMiss(_)
        )
    }

    /// Maps a ClickHouse server exception code, if recognized, to a typed variant.
    pub fn from_exception_code(code: i32, prefix: &str, message: &str) -> Option<BackupError> {
        match code {
            598 => Some(BackupError::ArchiveAlreadyExists(prefix.to_string())),
            599 => Some(BackupError::RestoreMissingOnReplica(prefix.to_string())),
            _ => {
                let _ = message;
                None
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

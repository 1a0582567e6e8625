//! Remote command execution over SSH: auth, sudo-wrapping, and output
//! sanitization via a per-call UUID sentinel (spec §4.2).

use crate::error::{BackupError, Result};
use crate::model::Replica;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use uuid::Uuid;

/// Output of one remote command.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub stdout: String,
    pub exit_status: i32,
}

/// Runs `command` on `replica` over SSH, authenticating with a password if
/// one is set, falling back to the default private key identity otherwise.
/// Non-root/clickhouse users get the command sudo-wrapped. The command's
/// real output is bracketed with a fresh UUID sentinel so legitimate output
/// containing shell-prompt-like text can never be mistaken for the fence.
pub async fn run_command(replica: &Replica, command: &str) -> Result<RemoteOutput> {
    let replica = replica.clone();
    let command = command.to_string();
    tokio::task::spawn_blocking(move || run_command_blocking(&replica, &command))
        .await
        .map_err(|e| BackupError::Other(e.into()))?
}

fn run_command_blocking(replica: &Replica, command: &str) -> Result<RemoteOutput> {
    let session = connect(replica)?;
    let sentinel = format!("__BACKUP_MARKER_{}__", Uuid::new_v4());
    let wrapped = wrap_command(replica, command, &sentinel);
    let on_transport_err = |e: ssh2::Error| transport_fail(replica, e);
    let sudo_wrapped = replica.ssh_user != "root" && replica.ssh_user != "clickhouse";

    let mut channel = session.channel_session().map_err(on_transport_err)?;
    if sudo_wrapped {
        // sudo needs a terminal to show its password prompt at all.
        channel.request_pty("xterm", None, None).map_err(on_transport_err)?;
    }
    channel.exec(&wrapped).map_err(on_transport_err)?;

    let raw = if sudo_wrapped && !replica.ssh_password.is_empty() {
        read_answering_sudo_prompt(&mut channel, &replica.ssh_password)?
    } else {
        let mut buf = String::new();
        channel
            .read_to_string(&mut buf)
            .map_err(|e| BackupError::RemoteTransportFail {
                host: replica.host.clone(),
                source: e.into(),
            })?;
        buf
    };
    channel.wait_close().map_err(on_transport_err)?;
    let status = channel.exit_status().map_err(on_transport_err)?;

    let stdout = sanitize(&raw, &sentinel);
    if status != 0 {
        return Err(BackupError::RemoteNonZeroExit {
            host: replica.host.clone(),
            command: command.to_string(),
            status,
            stderr: stdout,
        });
    }
    Ok(RemoteOutput {
        stdout,
        exit_status: status,
    })
}

/// Pushes `local_path` to `remote_path` on `replica` over SCP, marking it
/// executable (mode `0o755`) — used to stage the helper uploader binary
/// before the fallback-upload phase invokes it (spec §4.2, §4.5).
pub async fn push_file(replica: &Replica, local_path: &Path, remote_path: &str) -> Result<()> {
    let replica = replica.clone();
    let local_path = local_path.to_path_buf();
    let remote_path = remote_path.to_string();
    tokio::task::spawn_blocking(move || push_file_blocking(&replica, &local_path, &remote_path))
        .await
        .map_err(|e| BackupError::Other(e.into()))?
}

fn push_file_blocking(replica: &Replica, local_path: &Path, remote_path: &str) -> Result<()> {
    let session = connect(replica)?;
    let on_transport_err = |e: ssh2::Error| transport_fail(replica, e);

    let metadata = std::fs::metadata(local_path).map_err(|e| BackupError::Other(e.into()))?;
    let mut remote_file = session
        .scp_send(Path::new(remote_path), 0o755, metadata.len(), None)
        .map_err(on_transport_err)?;

    let mut local_file = std::fs::File::open(local_path).map_err(|e| BackupError::Other(e.into()))?;
    std::io::copy(&mut local_file, &mut remote_file).map_err(|e| BackupError::Other(e.into()))?;

    remote_file.send_eof().map_err(on_transport_err)?;
    remote_file.wait_eof().map_err(on_transport_err)?;
    remote_file.close().map_err(on_transport_err)?;
    remote_file.wait_close().map_err(on_transport_err)?;
    Ok(())
}

fn connect(replica: &Replica) -> Result<ssh2::Session> {
    let tcp = TcpStream::connect((replica.host.as_str(), replica.ssh_port)).map_err(|e| {
        BackupError::RemoteTransportFail {
            host: replica.host.clone(),
            source: e.into(),
        }
    })?;
    let mut session = ssh2::Session::new().map_err(|e| BackupError::RemoteTransportFail {
        host: replica.host.clone(),
        source: e.into(),
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| BackupError::RemoteTransportFail {
        host: replica.host.clone(),
        source: e.into(),
    })?;

    if replica.ssh_password.is_empty() {
        session
            .userauth_agent(&replica.ssh_user)
            .map_err(|e| BackupError::RemoteAuthFail {
                host: replica.host.clone(),
                source: e.into(),
            })?;
    } else {
        session
            .userauth_password(&replica.ssh_user, &replica.ssh_password)
            .map_err(|e| BackupError::RemoteAuthFail {
                host: replica.host.clone(),
                source: e.into(),
            })?;
    }

    if !session.authenticated() {
        return Err(BackupError::RemoteAuthFail {
            host: replica.host.clone(),
            source: anyhow::anyhow!("session not authenticated after handshake"),
        });
    }
    Ok(session)
}

/// Reads a sudo-wrapped channel's output byte by byte, writing the SSH
/// password to its stdin the moment a `"password"` prompt appears on the
/// tail of what's been read so far, same as the reference `SSHRun`'s
/// prompt-scan-then-reply loop.
fn read_answering_sudo_prompt(channel: &mut ssh2::Channel, password: &str) -> Result<String> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1];
    let mut password_sent = false;

    loop {
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                raw.extend_from_slice(&buf[..n]);
                if !password_sent && looks_like_password_prompt(&raw) {
                    channel
                        .write_all(format!("{password}\n").as_bytes())
                        .and_then(|_| channel.flush())
                        .map_err(|e| BackupError::Other(e.into()))?;
                    password_sent = true;
                }
            }
            Err(e) => return Err(BackupError::Other(e.into())),
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Looks at the last 64 bytes read so far for a sudo or generic SSH password
/// prompt. Scoped to a tail window so it doesn't re-match a prompt embedded
/// deep in unrelated command output.
fn looks_like_password_prompt(raw: &[u8]) -> bool {
    let tail_len = raw.len().min(64);
    let tail = String::from_utf8_lossy(&raw[raw.len() - tail_len..]);
    tail.contains("[sudo] password for") || tail.trim_end().ends_with("password:")
}

/// Sudo-wraps the command unless the SSH user is already `root` or
/// `clickhouse`, forces a stable locale, and fences the real output between
/// two echoes of the sentinel so it can be cleanly excised from any sudo
/// banner or locale warning noise.
fn wrap_command(replica: &Replica, command: &str, sentinel: &str) -> String {
    let body = if replica.ssh_user == "root" || replica.ssh_user == "clickhouse" {
        command.to_string()
    } else {
        format!("sudo -S {command}")
    };
    format!("echo '{sentinel}'; LANG=en_US.UTF-8 {body}; echo '{sentinel}'")
}

/// Strips everything outside the two sentinel echoes, and drops a leading
/// sudo password prompt line if one snuck in before the first echo.
fn sanitize(raw: &str, sentinel: &str) -> String {
    let first = match raw.find(sentinel) {
        Some(idx) => idx + sentinel.len(),
        None => return raw.to_string(),
    };
    let rest = &raw[first..];
    let body = match rest.rfind(sentinel) {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    body.trim_matches(['\r', '\n']).to_string()
}

fn transport_fail(replica: &Replica, err: ssh2::Error) -> BackupError {
    BackupError::RemoteTransportFail {
        host: replica.host.clone(),
        source: err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_only_text_between_sentinels() {
        let sentinel = "abc-123";
        let raw = format!("[sudo] password for u:\n{sentinel}\nhello\nworld\n{sentinel}\n");
        assert_eq!(sanitize(&raw, sentinel), "hello\nworld");
    }

    #[test]
    fn sanitize_is_safe_when_sentinel_absent() {
        let raw = "no sentinel here";
        assert_eq!(sanitize(raw, "abc-123"), raw);
    }

    #[test]
    fn root_and_clickhouse_users_are_never_sudo_wrapped() {
        let mut replica = Replica {
            host: "h1".into(),
            db_user: "default".into(),
            db_password: "".into(),
            ssh_user: "root".into(),
            ssh_password: "".into(),
            ssh_port: 22,
        };
        assert!(!wrap_command(&replica, "ls", "s").contains("sudo"));
        replica.ssh_user = "clickhouse".into();
        assert!(!wrap_command(&replica, "ls", "s").contains("sudo"));
        replica.ssh_user = "deploy".into();
        assert!(wrap_command(&replica, "ls", "s").contains("sudo -S"));
    }

    #[test]
    fn distinct_calls_use_distinct_sentinels() {
        let replica = Replica {
            host: "h1".into(),
            db_user: "default".into(),
            db_password: "".into(),
            ssh_user: "root".into(),
            ssh_password: "".into(),
            ssh_port: 22,
        };
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        assert_ne!(a, b);
        assert!(wrap_command(&replica, "ls", &a).contains(&a));
    }
}

//! OpenSSH client backend for the remote executor.
//!
//! Each command runs through the system `ssh` binary (`sshpass -e ssh` for
//! password auth) with a timeout. Private keys are written to a `0600` temp
//! file owned by the session and removed when the session is closed.

use async_trait::async_trait;
use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::error::RemoteError;
use crate::models::ResolvedCredential;
use crate::remote::{CommandOutput, RemoteExecutor, RemoteSession, SshTarget};

/// ssh reserves 255 for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;
/// sshpass: wrong password.
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub ssh_binary: String,
    pub sshpass_binary: String,
    pub command_timeout: Duration,
    pub strict_host_key_checking: bool,
    pub known_hosts_file: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            command_timeout: Duration::from_secs(60),
            strict_host_key_checking: false,
            known_hosts_file: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpenSshExecutor {
    settings: SshSettings,
}

impl OpenSshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn connect(&self, target: &SshTarget, timeout: Duration) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let (key_file, password) = match &target.credential {
            ResolvedCredential::PrivateKey(key) => (Some(write_key_file(key)?), None),
            ResolvedCredential::Password(password) => (None, Some(password.clone())),
        };

        let mut session = OpenSshSession {
            settings: self.settings.clone(),
            user: target.user.clone(),
            address: target.address.to_string(),
            port: target.port,
            connect_timeout: timeout,
            key_file,
            password,
        };

        // a no-op round trip surfaces auth/connect failures at connect time
        let output = session.run("true", None, timeout + Duration::from_secs(5)).await?;
        if !output.success() {
            return Err(RemoteError::Connect(format!(
                "handshake command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        debug!("[ssh] session opened to {}", target.endpoint());
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    settings: SshSettings,
    user: String,
    address: String,
    port: u16,
    connect_timeout: Duration,
    key_file: Option<NamedTempFile>,
    password: Option<String>,
}

impl OpenSshSession {
    async fn run(&mut self, command: &str, input: Option<&[u8]>, limit: Duration) -> Result<CommandOutput, RemoteError> {
        let args = ssh_args(
            &self.settings,
            &self.user,
            &self.address,
            self.port,
            self.key_file.as_ref().map(|f| f.path()),
            self.connect_timeout,
            command,
        );

        let mut cmd = match &self.password {
            Some(password) => {
                let mut cmd = AsyncCommand::new(&self.settings.sshpass_binary);
                cmd.arg("-e").arg(&self.settings.ssh_binary).env("SSHPASS", password);
                cmd
            }
            None => AsyncCommand::new(&self.settings.ssh_binary),
        };
        cmd.args(&args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RemoteError::Io(format!("failed to spawn ssh client: {e}")))?;
        let stdin = child.stdin.take();

        // feed stdin while collecting output so neither pipe can fill up and stall
        let feed = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::time::timeout(limit, async { tokio::join!(feed, child.wait_with_output()) })
            .await
            .map_err(|_| RemoteError::Io(format!("command timed out after {}s", limit.as_secs())))?;
        let output = output.map_err(|e| RemoteError::Io(format!("ssh client failed: {e}")))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if let Some(err) = classify_client_failure(result.exit_code, &result.stderr, self.password.is_some()) {
            return Err(err);
        }
        if let Err(e) = fed {
            // a remote failure explains itself through its exit code
            if result.success() {
                return Err(RemoteError::Io(format!("input not fully delivered: {e}")));
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let limit = self.settings.command_timeout;
        self.run(command, None, limit).await
    }

    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput, RemoteError> {
        let limit = self.settings.command_timeout;
        self.run(command, Some(input), limit).await
    }

    async fn close(self: Box<Self>) {
        debug!("[ssh] session to {}:{} closed", self.address, self.port);
        // dropping the NamedTempFile removes the key from disk
    }
}

fn write_key_file(key: &str) -> Result<NamedTempFile, RemoteError> {
    let mut file = NamedTempFile::new().map_err(|e| RemoteError::Io(format!("cannot stage private key: {e}")))?;
    file.write_all(key.as_bytes())
        .and_then(|_| if key.ends_with('\n') { Ok(()) } else { file.write_all(b"\n") })
        .and_then(|_| file.flush())
        .map_err(|e| RemoteError::Io(format!("cannot stage private key: {e}")))?;
    Ok(file)
}

/// Arguments passed to `ssh`, ending with the remote command.
pub fn ssh_args(
    settings: &SshSettings,
    user: &str,
    address: &str,
    port: u16,
    key_path: Option<&Path>,
    connect_timeout: Duration,
    command: &str,
) -> Vec<String> {
    let mut args = vec!["-p".to_string(), port.to_string()];
    push_option(&mut args, format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)));
    push_option(&mut args, "LogLevel=ERROR".to_string());
    push_option(
        &mut args,
        format!(
            "StrictHostKeyChecking={}",
            if settings.strict_host_key_checking { "yes" } else { "accept-new" }
        ),
    );
    if let Some(known_hosts) = &settings.known_hosts_file {
        push_option(&mut args, format!("UserKnownHostsFile={known_hosts}"));
    }

    match key_path {
        Some(path) => {
            push_option(&mut args, "BatchMode=yes".to_string());
            push_option(&mut args, "PasswordAuthentication=no".to_string());
            push_option(&mut args, "IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        None => {
            push_option(&mut args, "PubkeyAuthentication=no".to_string());
            push_option(&mut args, "NumberOfPasswordPrompts=1".to_string());
        }
    }

    args.push(format!("{user}@{address}"));
    args.push("--".to_string());
    args.push(command.to_string());
    args
}

fn push_option(args: &mut Vec<String>, option: String) {
    args.push("-o".to_string());
    args.push(option);
}

/// Diagnostics the ssh client prints on its own failures (LogLevel=ERROR).
const SSH_DIAGNOSTICS: &[&str] = &[
    "ssh:",
    "permission denied (",
    "host key verification failed",
    "connection refused",
    "connection timed out",
    "connection closed by",
    "connection reset by",
    "no route to host",
    "could not resolve hostname",
    "kex_exchange_identification",
    "too many authentication failures",
    "authentication failed",
];

/// Tells failures of the ssh client itself apart from remote exit codes.
/// A remote command may exit 255 too; only ssh's own diagnostics count.
pub fn classify_client_failure(exit_code: i32, stderr: &str, via_sshpass: bool) -> Option<RemoteError> {
    if via_sshpass && exit_code == SSHPASS_BAD_PASSWORD_EXIT {
        return Some(RemoteError::Auth("password rejected".to_string()));
    }
    if exit_code != SSH_FAILURE_EXIT {
        return None;
    }
    let reason = stderr.trim().to_string();
    let lowered = reason.to_lowercase();
    if !SSH_DIAGNOSTICS.iter().any(|marker| lowered.contains(marker)) {
        return None;
    }
    if lowered.contains("permission denied (")
        || lowered.contains("authentication failed")
        || lowered.contains("too many authentication failures")
    {
        Some(RemoteError::Auth(reason))
    } else {
        Some(RemoteError::Connect(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_auth_args() {
        let settings = SshSettings::default();
        let args = ssh_args(
            &settings,
            "ops",
            "10.0.0.5",
            2222,
            Some(Path::new("/tmp/key")),
            Duration::from_millis(10_000),
            "sudo systemctl restart telegraf",
        );

        assert_eq!(&args[..2], &["-p", "2222"]);
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/tmp/key");
        assert_eq!(&args[args.len() - 3..], &["ops@10.0.0.5", "--", "sudo systemctl restart telegraf"]);
    }

    #[test]
    fn test_password_auth_args() {
        let settings = SshSettings {
            strict_host_key_checking: true,
            known_hosts_file: Some("/var/lib/fleet/known_hosts".into()),
            ..SshSettings::default()
        };
        let args = ssh_args(&settings, "ops", "10.0.0.5", 22, None, Duration::from_millis(200), "true");

        assert!(args.contains(&"ConnectTimeout=1".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/var/lib/fleet/known_hosts".to_string()));
        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_classify_client_failure() {
        assert!(classify_client_failure(0, "", false).is_none());
        assert!(classify_client_failure(1, "cat: no such file", false).is_none());

        let auth = classify_client_failure(255, "ops@10.0.0.5: Permission denied (publickey).", false);
        assert!(matches!(auth, Some(RemoteError::Auth(_))));

        let refused = classify_client_failure(255, "ssh: connect to host 10.0.0.5 port 22: Connection refused", false);
        assert!(matches!(refused, Some(RemoteError::Connect(_))));

        let reset = classify_client_failure(255, "Connection closed by 10.0.0.5 port 22", false);
        assert!(matches!(reset, Some(RemoteError::Connect(_))));

        // the remote command itself exited 255
        assert!(classify_client_failure(255, "E! [agent] custom plugin aborted", false).is_none());
        assert!(classify_client_failure(255, "", false).is_none());

        assert!(matches!(classify_client_failure(5, "", true), Some(RemoteError::Auth(_))));
        assert!(classify_client_failure(5, "", false).is_none());
    }

    #[test]
    fn test_key_file_gets_trailing_newline() {
        let file = write_key_file("-----BEGIN KEY-----\nabc\n-----END KEY-----").unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.ends_with("-----END KEY-----\n"));
    }
}

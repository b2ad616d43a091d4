//! Telegraf configuration and service operations over the remote channel.
//!
//! Every operation opens one session to the host and closes it before
//! returning, whatever the outcome. `update_config` never touches the live
//! file before the final `mv`: it backs the file up, writes the new content
//! to a temp path, copies ownership and mode onto it, then moves it in place.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FleetError, StoreError};
use crate::models::{AuthMethod, Host, ResolvedCredential};
use crate::remote::{CommandOutput, RemoteExecutor, RemoteSession, SshTarget};
use crate::store::HostRecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceAction {
    pub const ALL: [ServiceAction; 4] = [
        ServiceAction::Start,
        ServiceAction::Stop,
        ServiceAction::Restart,
        ServiceAction::Reload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = FleetError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ServiceAction::ALL
            .into_iter()
            .find(|a| a.as_str() == raw)
            .ok_or_else(|| {
                let allowed: Vec<&str> = ServiceAction::ALL.iter().map(|a| a.as_str()).collect();
                FleetError::validation(
                    "action",
                    format!("'{raw}' is not allowed, expected one of: {}", allowed.join(", ")),
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigOpsSettings {
    pub connect_timeout: Duration,
    pub telegraf_binary: String,
    pub service_name: String,
    pub temp_dir: String,
}

impl Default for ConfigOpsSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            telegraf_binary: "/usr/bin/telegraf".to_string(),
            service_name: "telegraf".to_string(),
            temp_dir: "/tmp".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigUpdate {
    pub host: String,
    pub path: String,
    pub backup_path: String,
}

/// Output of `telegraf --test`. Telegraf logs to stderr even on success, so
/// neither stderr nor the exit code is treated as a failure here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigTest {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ConfigTest {
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => "Test command executed. No output received, which usually means success.".to_string(),
            (false, true) => self.stdout.clone(),
            _ => format!("OUTPUT:\n{}\n\nERROR/INFO:\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceActionOutcome {
    pub host: String,
    pub action: ServiceAction,
    pub message: String,
}

pub struct ConfigOps {
    store: Arc<dyn HostRecordStore>,
    executor: Arc<dyn RemoteExecutor>,
    clock: Arc<dyn Clock>,
    settings: ConfigOpsSettings,
}

impl ConfigOps {
    pub fn new(
        store: Arc<dyn HostRecordStore>,
        executor: Arc<dyn RemoteExecutor>,
        clock: Arc<dyn Clock>,
        settings: ConfigOpsSettings,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            settings,
        }
    }

    pub async fn get_config(&self, name: &str) -> Result<String, FleetError> {
        let host = self.load_host(name).await?;
        let mut session = self.open_session(&host).await?;
        let result = self.read_config(session.as_mut(), &host).await;
        session.close().await;
        result
    }

    pub async fn update_config(&self, name: &str, new_config: &str) -> Result<ConfigUpdate, FleetError> {
        let host = self.load_host(name).await?;
        let mut session = self.open_session(&host).await?;
        let result = self.replace_config(session.as_mut(), &host, new_config).await;
        session.close().await;

        match &result {
            Ok(update) => info!("[config-ops] {} updated, backup at {}", update.path, update.backup_path),
            Err(e) => warn!("[config-ops] config update on {} failed: {}", name, e),
        }
        result
    }

    pub async fn test_config(&self, name: &str) -> Result<ConfigTest, FleetError> {
        let host = self.load_host(name).await?;
        let command = format!(
            "sudo {} --config {} --test",
            shell_words::quote(&self.settings.telegraf_binary),
            shell_words::quote(&host.config_path)
        );

        let mut session = self.open_session(&host).await?;
        let result = exec(session.as_mut(), &host, &command).await;
        session.close().await;

        let output = result?;
        Ok(ConfigTest {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// The action is checked before the host is even looked up.
    pub async fn manage_service(&self, name: &str, action: &str) -> Result<ServiceActionOutcome, FleetError> {
        let action: ServiceAction = action.parse()?;
        let host = self.load_host(name).await?;
        let command = format!(
            "sudo systemctl {} {}",
            action,
            shell_words::quote(&self.settings.service_name)
        );

        let mut session = self.open_session(&host).await?;
        let result = exec(session.as_mut(), &host, &command).await;
        session.close().await;

        let output = result?;
        if !output.success() {
            return Err(FleetError::Command {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        info!("[config-ops] {} {} on {}", action, self.settings.service_name, host.name);
        Ok(ServiceActionOutcome {
            host: host.name.clone(),
            action,
            message: format!("Action '{}' sent to Telegraf service on {}.", action, host.name),
        })
    }

    async fn load_host(&self, name: &str) -> Result<Host, FleetError> {
        match self.store.get_host(name).await {
            Ok(host) => Ok(host),
            Err(StoreError::UnknownHost(_)) => Err(FleetError::NotFound(format!("host '{name}'"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_session(&self, host: &Host) -> Result<Box<dyn RemoteSession>, FleetError> {
        host.validate()?;
        let handle = host
            .credential
            .selected()
            .ok_or_else(|| FleetError::validation("credential", "no secret for the selected method"))?;
        let secret = self.store.resolve_secret(handle).await?;
        let credential = match host.credential.method {
            AuthMethod::Password => ResolvedCredential::Password(secret),
            AuthMethod::PrivateKey => ResolvedCredential::PrivateKey(secret),
        };

        let target = SshTarget::new(host, credential);
        self.executor
            .connect(&target, self.settings.connect_timeout)
            .await
            .map_err(|e| FleetError::from_remote(&target.endpoint(), e))
    }

    async fn ensure_config_exists(&self, session: &mut dyn RemoteSession, host: &Host) -> Result<(), FleetError> {
        let command = format!("sudo test -f {}", shell_words::quote(&host.config_path));
        let output = exec(session, host, &command).await?;
        if output.success() {
            return Ok(());
        }
        if output.stderr.trim().is_empty() {
            Err(FleetError::NotFound(format!(
                "config file {} on host '{}'",
                host.config_path, host.name
            )))
        } else {
            Err(FleetError::Command {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    async fn read_config(&self, session: &mut dyn RemoteSession, host: &Host) -> Result<String, FleetError> {
        self.ensure_config_exists(session, host).await?;

        let command = format!("sudo cat {}", shell_words::quote(&host.config_path));
        let output = exec(session, host, &command).await?;
        if !output.success() {
            return Err(FleetError::Command {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn replace_config(
        &self,
        session: &mut dyn RemoteSession,
        host: &Host,
        new_config: &str,
    ) -> Result<ConfigUpdate, FleetError> {
        self.ensure_config_exists(session, host).await?;

        let path = host.config_path.as_str();
        let backup_path = backup_path(path, &self.clock.now());
        let temp_path = format!(
            "{}/telegraf.conf.{}",
            self.settings.temp_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );

        let backup = format!("sudo cp -p {} {}", shell_words::quote(path), shell_words::quote(&backup_path));
        run_write_step(session, host, "backup", &backup, None).await?;

        let payload = encode_payload(new_config);
        let steps = [
            ("write temp file", write_command(&temp_path), Some(payload.as_slice())),
            (
                "fix ownership",
                format!("sudo chown --reference={} {}", shell_words::quote(path), shell_words::quote(&temp_path)),
                None,
            ),
            (
                "fix permissions",
                format!("sudo chmod --reference={} {}", shell_words::quote(path), shell_words::quote(&temp_path)),
                None,
            ),
            (
                "move into place",
                format!("sudo mv -f {} {}", shell_words::quote(&temp_path), shell_words::quote(path)),
                None,
            ),
        ];

        for (step, command, input) in steps {
            if let Err(e) = run_write_step(session, host, step, &command, input).await {
                let cleanup = format!("sudo rm -f {}", shell_words::quote(&temp_path));
                if let Err(cleanup_err) = exec(session, host, &cleanup).await {
                    warn!("[config-ops] could not remove {}: {}", temp_path, cleanup_err);
                }
                return Err(e);
            }
        }

        Ok(ConfigUpdate {
            host: host.name.clone(),
            path: path.to_string(),
            backup_path,
        })
    }
}

async fn exec(session: &mut dyn RemoteSession, host: &Host, command: &str) -> Result<CommandOutput, FleetError> {
    session
        .exec(command)
        .await
        .map_err(|e| FleetError::from_remote(&format!("{}:{}", host.address, host.ssh_port), e))
}

async fn run_write_step(
    session: &mut dyn RemoteSession,
    host: &Host,
    step: &'static str,
    command: &str,
    input: Option<&[u8]>,
) -> Result<(), FleetError> {
    let output = match input {
        Some(input) => session
            .exec_with_input(command, input)
            .await
            .map_err(|e| FleetError::from_remote(&format!("{}:{}", host.address, host.ssh_port), e))?,
        None => exec(session, host, command).await?,
    };
    if output.success() {
        return Ok(());
    }
    Err(FleetError::Write {
        path: host.config_path.clone(),
        step,
        stderr: output.stderr.trim().to_string(),
    })
}

/// `<path>.bak.<YYYYmmddHHMMSS>`
pub fn backup_path(path: &str, at: &time::OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!("[year][month][day][hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{path}.bak.{stamp}")
}

/// Decodes standard input into the temp file. The content itself is sent
/// as [`encode_payload`] on stdin, so neither the remote shell nor the
/// argument size limit ever sees it.
pub fn write_command(temp_path: &str) -> String {
    format!("base64 -d | sudo tee {} > /dev/null", shell_words::quote(temp_path))
}

pub fn encode_payload(content: &str) -> Vec<u8> {
    let mut encoded = BASE64_STANDARD.encode(content.as_bytes()).into_bytes();
    encoded.push(b'\n');
    encoded
}

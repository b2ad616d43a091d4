use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

use crate::config_ops::ConfigOpsSettings;
use crate::error::FleetError;
use crate::models::{
    parse_address, validate_port, AuthMethod, Credential, Host, HostStatus, SecretRef, DEFAULT_CONFIG_PATH,
    DEFAULT_SSH_PORT,
};
use crate::ssh::SshSettings;
use crate::store::HostRecordStore;
use crate::sweep::{SweepSettings, MONITORING_SOURCE};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub monitor: MonitorConf,
    pub retention: RetentionConf,
    pub ssh: SshConf,
    pub telegraf: TelegrafConf,
    pub store: StoreConf,
    pub mqtt: Option<MqttConf>,
    pub hosts: BTreeMap<String, HostConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8088".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConf {
    pub interval_secs: u64,
    pub workers: usize,
    pub probe_timeout_ms: u64,
    pub task_ceiling_ms: u64,
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            workers: 20,
            probe_timeout_ms: 5_000,
            task_ceiling_ms: 15_000,
        }
    }
}

impl MonitorConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            workers: self.workers.max(1),
            task_ceiling: Duration::from_millis(self.task_ceiling_ms),
            source: MONITORING_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConf {
    pub max_age_days: u32,
    pub interval_secs: u64,
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self {
            max_age_days: 7,
            interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub ssh_binary: String,
    pub sshpass_binary: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub strict_host_key_checking: bool,
    pub known_hosts_file: Option<String>,
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".into(),
            sshpass_binary: "sshpass".into(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 60_000,
            strict_host_key_checking: false,
            known_hosts_file: None,
        }
    }
}

impl SshConf {
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_binary: self.ssh_binary.clone(),
            sshpass_binary: self.sshpass_binary.clone(),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            strict_host_key_checking: self.strict_host_key_checking,
            known_hosts_file: self.known_hosts_file.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelegrafConf {
    pub binary: String,
    pub service: String,
    pub temp_dir: String,
}

impl Default for TelegrafConf {
    fn default() -> Self {
        let ops = ConfigOpsSettings::default();
        Self {
            binary: ops.telegraf_binary,
            service: ops.service_name,
            temp_dir: ops.temp_dir,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub path: String,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            path: "fleet-store.json".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "fleet".into()
}

/// Host declaration in kernel.yaml; secrets are handles (`env:`, `file:` or literal).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostConf {
    #[serde(default)]
    pub hostname: Option<String>,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_update_config: bool,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_config_path() -> String {
    DEFAULT_CONFIG_PATH.into()
}

impl HostConf {
    /// Builds the stored record for a declared host, status starting at `Unknown`.
    pub fn to_host(&self, name: &str) -> Result<Host, FleetError> {
        let host = Host {
            name: name.to_string(),
            hostname: self.hostname.clone().unwrap_or_else(|| name.to_string()),
            address: parse_address(&self.address)?,
            ssh_port: validate_port(self.ssh_port)?,
            ssh_user: self.ssh_user.clone(),
            credential: Credential {
                method: self.auth_method,
                password: self.password.clone().map(SecretRef),
                private_key: self.private_key.clone().map(SecretRef),
            },
            config_path: self.config_path.clone(),
            status: if self.disabled { HostStatus::Disabled } else { HostStatus::Unknown },
            last_status_check: None,
            auto_update_config: self.auto_update_config,
        };
        host.validate()?;
        Ok(host)
    }
}

impl KernelConfig {
    pub fn config_ops_settings(&self) -> ConfigOpsSettings {
        ConfigOpsSettings {
            connect_timeout: Duration::from_millis(self.ssh.connect_timeout_ms),
            telegraf_binary: self.telegraf.binary.clone(),
            service_name: self.telegraf.service.clone(),
            temp_dir: self.telegraf.temp_dir.clone(),
        }
    }
}

/// Writes declared hosts into the store. A host already on record keeps its
/// status and last check unless it is being disabled or re-enabled.
pub async fn seed_hosts(store: &dyn HostRecordStore, hosts: &BTreeMap<String, HostConf>) -> usize {
    let mut seeded = 0;
    for (name, conf) in hosts {
        let mut host = match conf.to_host(name) {
            Ok(host) => host,
            Err(e) => {
                warn!("[kernel] skipping host {}: {}", name, e);
                continue;
            }
        };
        if let Ok(existing) = store.get_host(name).await {
            let toggled = (existing.status == HostStatus::Disabled) != (host.status == HostStatus::Disabled);
            if !toggled {
                host.status = existing.status;
                host.last_status_check = existing.last_status_check;
            }
        }
        match store.upsert_host(host).await {
            Ok(()) => seeded += 1,
            Err(e) => warn!("[kernel] could not store host {}: {}", name, e),
        }
    }
    seeded
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[kernel] invalid config {}: {}", path, e);
            KernelConfig::default()
        })
    } else {
        info!("[kernel] no {} found, using default config", path);
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::JsonStore;
    use time::macros::datetime;

    const SAMPLE: &str = r#"
http:
  bind: "127.0.0.1:9000"
monitor:
  workers: 8
  task_ceiling_ms: 2000
mqtt:
  host: broker.lan
hosts:
  web-01:
    address: 10.0.0.5
    ssh_user: ops
    auth_method: private_key
    private_key: file:/etc/fleet/keys/web-01
  db-01:
    hostname: db-01.lan
    address: 10.0.0.6
    ssh_port: 2222
    ssh_user: ops
    auth_method: password
    password: env:DB01_SSH_PASSWORD
    disabled: true
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.http.bind, "127.0.0.1:9000");
        assert_eq!(cfg.monitor.workers, 8);
        assert_eq!(cfg.monitor.interval_secs, 60);
        assert_eq!(cfg.monitor.sweep_settings().task_ceiling, Duration::from_secs(2));
        assert_eq!(cfg.retention.max_age_days, 7);

        let mqtt = cfg.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic_prefix, "fleet");

        let web = cfg.hosts["web-01"].to_host("web-01").unwrap();
        assert_eq!(web.hostname, "web-01");
        assert_eq!(web.ssh_port, 22);
        assert_eq!(web.config_path, DEFAULT_CONFIG_PATH);
        assert_eq!(web.status, HostStatus::Unknown);

        let db = cfg.hosts["db-01"].to_host("db-01").unwrap();
        assert_eq!(db.status, HostStatus::Disabled);
        assert_eq!(db.credential.selected(), Some(&SecretRef("env:DB01_SSH_PASSWORD".into())));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("   \n").unwrap();
        assert!(cfg.hosts.is_empty());
        assert!(cfg.mqtt.is_none());
        assert_eq!(cfg.config_ops_settings().service_name, "telegraf");
        assert_eq!(cfg.config_ops_settings().connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_host_conf_validation() {
        let mut conf = parse_config(SAMPLE).unwrap().hosts["web-01"].clone();
        conf.address = "10.0.0.300".into();
        assert_eq!(conf.to_host("web-01").unwrap_err().kind(), ErrorKind::Validation);

        conf.address = "10.0.0.5".into();
        conf.private_key = None;
        assert_eq!(conf.to_host("web-01").unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_seed_keeps_recorded_status() {
        let store = JsonStore::in_memory();
        let mut hosts = parse_config(SAMPLE).unwrap().hosts;
        let broken = HostConf {
            address: "not-an-ip".into(),
            ..hosts["web-01"].clone()
        };
        hosts.insert("broken".into(), broken);
        assert_eq!(seed_hosts(&store, &hosts).await, 2);

        store
            .set_status("web-01", HostStatus::Active, datetime!(2026-01-01 0:00 UTC))
            .await
            .unwrap();
        assert_eq!(seed_hosts(&store, &hosts).await, 2);
        assert_eq!(store.get_host("web-01").await.unwrap().status, HostStatus::Active);

        hosts.get_mut("web-01").unwrap().disabled = true;
        seed_hosts(&store, &hosts).await;
        assert_eq!(store.get_host("web-01").await.unwrap().status, HostStatus::Disabled);
    }
}

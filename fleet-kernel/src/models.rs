use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::FleetError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONFIG_PATH: &str = "/etc/telegraf/telegraf.conf";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostStatus {
    Active,
    Inactive,
    Down,
    #[default]
    Unknown,
    Disabled,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Active => "Active",
            HostStatus::Inactive => "Inactive",
            HostStatus::Down => "Down",
            HostStatus::Unknown => "Unknown",
            HostStatus::Disabled => "Disabled",
        }
    }

    /// Disabled hosts are the only ones left out of a sweep.
    pub fn is_monitorable(&self) -> bool {
        *self != HostStatus::Disabled
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    PrivateKey,
}

/// Handle on a secret; the store decides how it is resolved.
/// `env:NAME` reads an environment variable, `file:/path` reads a file,
/// anything else is taken literally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl SecretRef {
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<SecretRef>,
}

impl Credential {
    /// Handle matching the selected method, if one is configured.
    pub fn selected(&self) -> Option<&SecretRef> {
        let handle = match self.method {
            AuthMethod::Password => self.password.as_ref(),
            AuthMethod::PrivateKey => self.private_key.as_ref(),
        };
        handle.filter(|h| !h.is_blank())
    }
}

/// Secret material handed to the remote executor, already resolved.
#[derive(Clone)]
pub enum ResolvedCredential {
    Password(String),
    PrivateKey(String),
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedCredential::Password(_) => f.write_str("Password(<redacted>)"),
            ResolvedCredential::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub hostname: String,
    pub address: Ipv4Addr,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub credential: Credential,
    pub config_path: String,
    pub status: HostStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_status_check: Option<OffsetDateTime>,
    #[serde(default)]
    pub auto_update_config: bool,
}

impl Host {
    /// Checks the invariants required before any remote operation.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.name.trim().is_empty() {
            return Err(FleetError::validation("name", "host name is empty"));
        }
        validate_port(self.ssh_port)?;
        if self.ssh_user.trim().is_empty() {
            return Err(FleetError::validation("ssh_user", format!("no SSH user for host '{}'", self.name)));
        }
        if self.credential.selected().is_none() {
            let wanted = match self.credential.method {
                AuthMethod::Password => "SSH password",
                AuthMethod::PrivateKey => "SSH private key",
            };
            return Err(FleetError::validation(
                "credential",
                format!("{wanted} is not set for host '{}'", self.name),
            ));
        }
        Ok(())
    }

    pub fn summary(&self) -> HostSummary {
        HostSummary {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            address: self.address,
            ssh_port: self.ssh_port,
            status: self.status,
            last_status_check: self.last_status_check,
        }
    }
}

pub fn parse_address(raw: &str) -> Result<Ipv4Addr, FleetError> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| FleetError::validation("address", format!("'{raw}' is not an IPv4 address")))
}

pub fn validate_port(port: u16) -> Result<u16, FleetError> {
    if port == 0 {
        return Err(FleetError::validation("ssh_port", "port must be within 1..=65535"));
    }
    Ok(port)
}

/// What a sweep needs to know about a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub name: String,
    pub hostname: String,
    pub address: Ipv4Addr,
    pub ssh_port: u16,
    pub status: HostStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_status_check: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "Status Change")]
    StatusChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StatusChange => "Status Change",
        }
    }
}

/// Immutable log entry for a significant transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatusEvent {
    pub id: Uuid,
    pub host: String,
    pub event_type: EventType,
    pub old_status: HostStatus,
    pub new_status: HostStatus,
    pub response_time_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub details: String,
}

impl HostStatusEvent {
    pub fn status_change(
        host: &str,
        old_status: HostStatus,
        new_status: HostStatus,
        response_time_ms: f64,
        timestamp: Option<OffsetDateTime>,
        source: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            event_type: EventType::StatusChange,
            old_status,
            new_status,
            response_time_ms,
            timestamp: timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            details: format!("{source}: {old_status} -> {new_status}"),
        }
    }
}

/// Fresh result of one connectivity check, consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub host: String,
    pub reachable: bool,
    pub latency_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

//! Host records and a controllable clock for scenarios.

use fleet_kernel::clock::Clock;
use fleet_kernel::models::{AuthMethod, Credential, Host, HostStatus, SecretRef, DEFAULT_CONFIG_PATH};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_NOW: OffsetDateTime = datetime!(2026-04-02 08:30:00 UTC);

pub struct HostBuilder {
    host: Host,
}

impl HostBuilder {
    /// Password-authenticated host at 10.20.0.1, status `Unknown`.
    pub fn new(name: &str) -> Self {
        Self {
            host: Host {
                name: name.to_string(),
                hostname: format!("{name}.fleet.lan"),
                address: Ipv4Addr::new(10, 20, 0, 1),
                ssh_port: 22,
                ssh_user: "telegraf-admin".to_string(),
                credential: Credential {
                    method: AuthMethod::Password,
                    password: Some(SecretRef("s3cret".to_string())),
                    private_key: None,
                },
                config_path: DEFAULT_CONFIG_PATH.to_string(),
                status: HostStatus::Unknown,
                last_status_check: None,
                auto_update_config: false,
            },
        }
    }

    pub fn status(mut self, status: HostStatus) -> Self {
        self.host.status = status;
        self
    }

    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.host.address = address;
        self
    }

    pub fn config_path(mut self, path: &str) -> Self {
        self.host.config_path = path.to_string();
        self
    }

    pub fn private_key(mut self, handle: &str) -> Self {
        self.host.credential = Credential {
            method: AuthMethod::PrivateKey,
            password: None,
            private_key: Some(SecretRef(handle.to_string())),
        };
        self
    }

    pub fn password(mut self, handle: &str) -> Self {
        self.host.credential = Credential {
            method: AuthMethod::Password,
            password: Some(SecretRef(handle.to_string())),
            private_key: None,
        };
        self
    }

    pub fn build(self) -> Host {
        self.host
    }
}

#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl FixedClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock() = now;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(DEFAULT_NOW)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

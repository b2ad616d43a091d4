//! Administrative channel to a host.
//!
//! A [`RemoteExecutor`] opens an authenticated [`RemoteSession`]; each session
//! belongs to exactly one operation and is closed by it on every exit path.

use async_trait::async_trait;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::RemoteError;
use crate::models::{Host, ResolvedCredential};

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub user: String,
    pub credential: ResolvedCredential,
}

impl SshTarget {
    pub fn new(host: &Host, credential: ResolvedCredential) -> Self {
        Self {
            host: host.name.clone(),
            address: host.address,
            port: host.ssh_port,
            user: host.ssh_user.clone(),
            credential,
        }
    }

    /// `address:port`, used in diagnostics.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, target: &SshTarget, timeout: Duration) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Runs `command` with `input` on its standard input. Bulk content goes
    /// here rather than into the command line, which the OS caps in size.
    async fn exec_with_input(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput, RemoteError>;

    async fn close(self: Box<Self>);
}

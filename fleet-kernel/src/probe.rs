//! Single-host reachability check.
//!
//! A probe is a bounded TCP connect against the host's administrative port.
//! Refusal, timeout and unreachable networks all come back as
//! `reachable = false`; the latency is measured in every case.

use async_trait::async_trait;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::models::HostSummary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub latency_ms: f64,
}

/// Everything a prober needs to check one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl From<&HostSummary> for ProbeTarget {
    fn from(summary: &HostSummary) -> Self {
        Self {
            host: summary.name.clone(),
            address: summary.address,
            port: summary.ssh_port,
        }
    }
}

pub async fn probe(address: Ipv4Addr, port: u16, timeout: Duration) -> ProbeOutcome {
    let addr = SocketAddr::from((address, port));
    let started = Instant::now();
    let reachable = matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    );
    ProbeOutcome {
        reachable,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Seam used by the sweep coordinator to check a host.
///
/// An `Err` means the check itself could not run (not that the host is
/// down) and is treated as a failed task for that host.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> anyhow::Result<ProbeOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &ProbeTarget) -> anyhow::Result<ProbeOutcome> {
        Ok(probe(target.address, target.port, self.timeout).await)
    }
}

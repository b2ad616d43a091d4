//! Fleet kernel: reachability sweeps and Telegraf administration for a
//! fleet of hosts.
//!
//! The binary in `main.rs` wires these modules together; the devkit crate
//! reuses them with test doubles behind the same traits.

pub mod clock;
pub mod config;
pub mod config_ops;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod notify;
pub mod probe;
pub mod reconcile;
pub mod remote;
pub mod reports;
pub mod retention;
pub mod ssh;
pub mod store;
pub mod sweep;

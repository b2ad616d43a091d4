//! Error taxonomy shared by the sweep engine, the config operations and the
//! admin surface.

use serde::Serialize;

/// Stable error kind, used by the admin surface to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Auth,
    NotFound,
    Write,
    Command,
    Validation,
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("authentication to {target} failed: {reason}")]
    Auth { target: String, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write to {path} failed during {step}: {stderr}")]
    Write {
        path: String,
        step: &'static str,
        stderr: String,
    },
    #[error("command `{command}` exited with code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FleetError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        FleetError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Connect { .. } => ErrorKind::Connect,
            FleetError::Auth { .. } => ErrorKind::Auth,
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::Write { .. } => ErrorKind::Write,
            FleetError::Command { .. } => ErrorKind::Command,
            FleetError::Validation { .. } => ErrorKind::Validation,
            FleetError::Store(StoreError::UnknownHost(_)) => ErrorKind::NotFound,
            // a credential that cannot be resolved is a host definition problem
            FleetError::Store(StoreError::SecretUnavailable(_)) => ErrorKind::Validation,
            FleetError::Store(_) => ErrorKind::Store,
        }
    }

    /// Maps a failure of the remote channel onto the taxonomy.
    pub fn from_remote(target: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(reason) => FleetError::Auth {
                target: target.to_string(),
                reason,
            },
            RemoteError::Connect(reason) | RemoteError::Io(reason) => FleetError::Connect {
                target: target.to_string(),
                reason,
            },
        }
    }
}

/// Errors raised by a [`crate::store::HostRecordStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("host '{0}' does not exist")]
    UnknownHost(String),
    #[error("secret handle '{0}' could not be resolved")]
    SecretUnavailable(String),
    #[error("commit rejected: {0}")]
    Commit(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a [`crate::remote::RemoteExecutor`] or one of its sessions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("unreachable: {0}")]
    Connect(String),
    #[error("channel failure: {0}")]
    Io(String),
}

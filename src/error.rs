//! Error types for device sessions and backup runs.
//!
//! Per-device errors are non-fatal to a run: the orchestrator records the
//! display string as the device's last error and moves on. Run-level errors
//! (`BackupRootUnset`, `TransferServerUnset`, `RunInProgress`) abort before
//! any device is processed.

use thiserror::Error;

/// Errors that can occur while backing up a device or driving a run.
#[derive(Error, Debug)]
pub enum BackupError {
    /// No transport is permitted for the device's connection type.
    #[error("no supported transport for this device")]
    TransportUnsupported,

    /// The network connection could not be opened.
    #[error("unable to open network connection to {0}")]
    Unreachable(String),

    /// The device address did not resolve to an IP address.
    #[error("unknown host {0}")]
    UnknownHost(String),

    /// The device rejected the login credentials.
    #[error("login failed")]
    AuthFailed,

    /// Privilege escalation did not reach an enabled prompt.
    #[error("enable login failed")]
    EnableFailed,

    /// The device refused the session outright.
    #[error("access not permitted")]
    AccessDenied,

    /// An interactive dialog gave no recognizable answer within its bound.
    ///
    /// Retryable inside the bounded loops; terminal once the bound is spent.
    #[error("dialog timed out after {0} rounds")]
    DialogTimeout(u32),

    /// The transferred configuration never appeared, was empty, or unreadable.
    #[error("no config uploaded from device")]
    NoConfigRetrieved,

    /// The configuration failed the structural end-marker check.
    #[error("bad download of config")]
    ValidationFailed,

    /// The on-disk backup is shorter than the in-memory payload.
    #[error("backup file failed write verification")]
    WriteVerificationFailed,

    /// The device session channel closed while output was expected.
    #[error("channel closed while waiting for device output")]
    ChannelClosed,

    /// Run-level: the backup path is not set or is not a directory.
    #[error("backup path is not set or is not a directory")]
    BackupRootUnset,

    /// Run-level: the transfer server address is not set.
    #[error("transfer server is not set")]
    TransferServerUnset,

    /// Run-level: another scheduled run is already active.
    ///
    /// Carries the unix timestamp the active run started at.
    #[error("backup already running since {0}")]
    RunInProgress(i64),

    /// A collaborator or settings problem not tied to a single device.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error surfaced by the async-ssh2-tokio library.
    #[error("ssh error: {0}")]
    Ssh(#[from] async_ssh2_tokio::Error),

    /// An error surfaced by the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),
}

impl BackupError {
    /// True for run-level conditions that must abort before device processing.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::BackupRootUnset
                | BackupError::TransferServerUnset
                | BackupError::RunInProgress(_)
        )
    }
}

//! Engine settings and fixed tunables.
//!
//! [`Settings`] carries the deployment-specific knobs (backup root, transfer
//! server, retention, notification recipients). It is loaded from an optional
//! TOML file with an environment-variable overlay, or constructed directly by
//! an embedding application.

use std::path::PathBuf;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

use crate::error::BackupError;

/// Payloads at or below this size are treated as a failed download.
pub const MIN_CONFIG_BYTES: usize = 100;

/// Upper bound on transfer dialog rounds.
pub const DIALOG_MAX_ROUNDS: u32 = 30;

/// Upper bound on prompt-probe and login-wait loops.
pub const PROMPT_MAX_ROUNDS: u32 = 10;

/// A run marker older than this is considered stale and may be replaced.
pub const RUN_STALE_SECS: i64 = 7200;

/// Retry passes skip devices attempted within this window.
pub const RETRY_WINDOW_SECS: i64 = 7200;

/// Grace added to the schedule interval before a device is due again.
pub const SCHEDULE_GRACE_SECS: i64 = 3600;

/// Reboot-derived change times within this skew of the recorded one are noise.
pub const CHANGE_SKEW_SECS: i64 = 60;

/// Per-read timeout inside the command channel's response loop.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Settle delay after writing a command, before reading the reply.
pub const SETTLE_DELAY: Duration = Duration::from_millis(125);

const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Deployment settings for the backup engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory the transfer server deposits files into and backups
    /// are stored under.
    pub backup_path: PathBuf,

    /// Address of the transfer (TFTP) server, as the devices reach it.
    pub transfer_server: String,

    /// Days to keep backup records; values outside 1..=365 fall back to 30.
    pub retention_days: u32,

    /// Recipient of the summary notification. Empty disables mail.
    pub email_to: String,

    /// Sender address for the summary notification.
    pub email_from: String,

    /// Display name for the sender; defaults to "Config Backups" when empty.
    pub email_from_name: String,

    /// When set, every raw chunk read from a device is also logged.
    pub debug_buffer: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_path: PathBuf::new(),
            transfer_server: String::new(),
            retention_days: DEFAULT_RETENTION_DAYS,
            email_to: String::new(),
            email_from: String::new(),
            email_from_name: String::new(),
            debug_buffer: false,
        }
    }
}

impl Settings {
    /// Loads settings from `confgrab.toml` (if present) with a
    /// `CONFGRAB_`-prefixed environment overlay.
    pub fn load() -> Result<Self, BackupError> {
        Self::load_from("confgrab.toml")
    }

    /// Loads settings from an explicit TOML path plus the environment overlay.
    pub fn load_from(path: &str) -> Result<Self, BackupError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONFGRAB_"))
            .extract()
            .map_err(|err| BackupError::Config(err.to_string()))
    }

    /// Retention horizon in days, clamped to the supported range.
    pub fn retention_days_clamped(&self) -> u32 {
        if (1..=365).contains(&self.retention_days) {
            self.retention_days
        } else {
            DEFAULT_RETENTION_DAYS
        }
    }

    /// Checks run-level preconditions before any device is processed.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.backup_path.as_os_str().len() < 2 || !self.backup_path.is_dir() {
            return Err(BackupError::BackupRootUnset);
        }
        if self.transfer_server.len() < 2 {
            return Err(BackupError::TransferServerUnset);
        }
        Ok(())
    }
}

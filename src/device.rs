//! Device registry data model and dialect catalog.
//!
//! A [`Device`] row carries the mutable backup bookkeeping the orchestrator
//! and fetch pipeline update. A [`DeviceType`] describes a vendor dialect:
//! the prompt fragments, commands, and validation flags needed to drive one
//! device family through the login / enable / copy workflow.

use serde::{Deserialize, Serialize};

use crate::error::BackupError;

/// Which transports may be attempted for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Try SSH first, then fall back to Telnet.
    #[default]
    Both,
    Ssh,
    Telnet,
}

impl ConnectionType {
    pub fn allows_ssh(self) -> bool {
        matches!(self, ConnectionType::Both | ConnectionType::Ssh)
    }

    pub fn allows_telnet(self) -> bool {
        matches!(self, ConnectionType::Both | ConnectionType::Telnet)
    }
}

/// A managed network device and its backup bookkeeping.
///
/// Timestamps are unix seconds; zero means "never". `debug` holds the
/// base64-encoded transcript of the most recent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub hostname: String,
    /// Hostname or dotted-quad the device is reached at.
    pub address: String,
    /// Per-device subdirectory under the backup root.
    pub directory: String,
    /// Name of the dialect in the device-type catalog.
    pub device_type: String,
    pub connection_type: ConnectionType,
    /// Backup interval in days.
    pub schedule_days: i64,
    pub enabled: bool,
    pub last_backup: i64,
    pub last_attempt: i64,
    pub last_error: String,
    /// Unix time of the last detected configuration change.
    pub last_change: i64,
    /// Who made the last detected change ("-- Reboot --" for uptime-derived).
    pub last_user: String,
    pub debug: String,
}

impl Device {
    /// A device with sane defaults for the given identity, due immediately.
    pub fn new(id: u64, hostname: &str, address: &str) -> Self {
        Self {
            id,
            hostname: hostname.to_string(),
            address: address.to_string(),
            directory: hostname.to_string(),
            device_type: String::new(),
            connection_type: ConnectionType::Both,
            schedule_days: 1,
            enabled: true,
            last_backup: 0,
            last_attempt: 0,
            last_error: String::new(),
            last_change: 0,
            last_user: String::new(),
            debug: String::new(),
        }
    }
}

/// Vendor dialect descriptor, read-only per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceType {
    pub name: String,
    /// Substring that identifies the login username prompt.
    pub username_prompt: String,
    /// Substring that identifies password prompts (login and enable).
    pub password_prompt: String,
    /// Command that requests privilege escalation.
    pub enable_cmd: String,
    /// Copy-to-transfer command; `%SERVER%` and `%FILE%` are substituted.
    pub copy_cmd: String,
    /// Command whose output reports uptime; empty disables the fallback.
    pub version_cmd: String,
    /// Always answer the confirmation prompt, even if none is detected.
    pub force_confirm: bool,
    /// Require the payload to close with an `end` line.
    pub check_end: bool,
}

impl Default for DeviceType {
    /// Fallback dialect used when a device references an unknown type.
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            username_prompt: "username:".to_string(),
            password_prompt: "password:".to_string(),
            enable_cmd: "en".to_string(),
            copy_cmd: "copy start tftp".to_string(),
            version_cmd: "show version".to_string(),
            force_confirm: false,
            check_end: true,
        }
    }
}

/// Names of the built-in dialects.
pub const BUILTIN_DIALECTS: &[&str] = &["cisco-ios", "cisco-asa", "hp-procurve", "juniper-screenos"];

/// Returns a built-in dialect by name.
pub fn dialect(name: &str) -> Option<DeviceType> {
    let dialect = match name {
        "cisco-ios" => DeviceType {
            name: "cisco-ios".to_string(),
            copy_cmd: "copy running-config tftp".to_string(),
            ..DeviceType::default()
        },
        "cisco-asa" => DeviceType {
            name: "cisco-asa".to_string(),
            copy_cmd: "copy running-config tftp://%SERVER%/%FILE%".to_string(),
            force_confirm: true,
            check_end: false,
            ..DeviceType::default()
        },
        "hp-procurve" => DeviceType {
            name: "hp-procurve".to_string(),
            copy_cmd: "copy running-config tftp %SERVER% %FILE%".to_string(),
            enable_cmd: "enable".to_string(),
            check_end: false,
            ..DeviceType::default()
        },
        "juniper-screenos" => DeviceType {
            name: "juniper-screenos".to_string(),
            copy_cmd: "save config to tftp %SERVER% %FILE%".to_string(),
            version_cmd: "get system".to_string(),
            check_end: false,
            ..DeviceType::default()
        },
        _ => return None,
    };
    Some(dialect)
}

/// Returns the full built-in dialect catalog.
pub fn builtin_dialects() -> Vec<DeviceType> {
    BUILTIN_DIALECTS.iter().filter_map(|name| dialect(name)).collect()
}

/// Loads additional dialects from a JSON catalog file.
///
/// The file holds an array of [`DeviceType`] objects; missing fields fall
/// back to the generic dialect's values.
pub async fn load_dialects(path: &std::path::Path) -> Result<Vec<DeviceType>, BackupError> {
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw)
        .map_err(|err| BackupError::Config(format!("bad dialect catalog {}: {err}", path.display())))
}

/// Account credentials for a device, decoded for the duration of one run.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub enable_password: String,
}

/// Renders a secret as a character count for logging.
///
/// Secrets must never appear verbatim in logs or transcripts; every call
/// site that logs near a password goes through this.
pub fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else {
        format!("({} chars)", secret.chars().count())
    }
}

/// A stored configuration backup. Append-only; purged by retention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Device id the backup belongs to.
    pub device: u64,
    /// Unix time the backup was taken.
    pub btime: i64,
    pub directory: String,
    pub filename: String,
    /// The configuration payload, line endings normalized.
    pub config: String,
    pub last_change: i64,
    pub last_user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_type_gates_transports() {
        assert!(ConnectionType::Both.allows_ssh());
        assert!(ConnectionType::Both.allows_telnet());
        assert!(ConnectionType::Ssh.allows_ssh());
        assert!(!ConnectionType::Ssh.allows_telnet());
        assert!(!ConnectionType::Telnet.allows_ssh());
        assert!(ConnectionType::Telnet.allows_telnet());
    }

    #[test]
    fn mask_reports_length_not_content() {
        assert_eq!(mask("hunter2"), "(7 chars)");
        assert_eq!(mask(""), "(not set)");
        assert!(!mask("hunter2").contains("hunter2"));
    }

    #[test]
    fn builtin_catalog_resolves_every_name() {
        for name in BUILTIN_DIALECTS {
            let dialect = dialect(name).expect("builtin dialect");
            assert_eq!(&dialect.name, name);
            assert!(!dialect.copy_cmd.is_empty());
        }
        assert!(dialect("does-not-exist").is_none());
        assert_eq!(builtin_dialects().len(), BUILTIN_DIALECTS.len());
    }

    #[test]
    fn unknown_device_type_falls_back_to_generic() {
        let fallback = DeviceType::default();
        assert_eq!(fallback.username_prompt, "username:");
        assert_eq!(fallback.password_prompt, "password:");
        assert!(fallback.check_end);
    }

    #[tokio::test]
    async fn catalog_file_fills_missing_fields_from_generic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dialects.json");
        std::fs::write(
            &path,
            r#"[{"name": "lab-switch", "copy_cmd": "copy run tftp %SERVER% %FILE%", "check_end": false}]"#,
        )
        .expect("write catalog");

        let loaded = load_dialects(&path).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "lab-switch");
        assert!(!loaded[0].check_end);
        assert_eq!(loaded[0].password_prompt, "password:");
    }

    #[tokio::test]
    async fn malformed_catalog_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dialects.json");
        std::fs::write(&path, "{not json").expect("write catalog");
        let err = load_dialects(&path).await.expect_err("malformed");
        assert!(matches!(err, BackupError::Config(_)));
    }
}

//! On-disk persistence of validated configs and retention sweeps.

use std::path::Path;

use chrono::Local;
use log::{info, warn};

use crate::config::{MIN_CONFIG_BYTES, Settings};
use crate::device::{BackupRecord, Device};
use crate::error::BackupError;
use crate::registry::BackupStore;

/// Writes a validated config under the device's directory and returns the
/// record describing it.
///
/// The stored name carries a minute-resolution local timestamp, so two
/// backups in the same minute overwrite each other; the overwrite is
/// logged. A payload at or below the plausibility floor is rejected, and a
/// short write (disk full, quota) is surfaced rather than recorded.
pub async fn save_backup(
    backup_root: &Path,
    device: &Device,
    filename: &str,
    payload: &str,
    last_change: i64,
    last_user: &str,
) -> Result<BackupRecord, BackupError> {
    if payload.len() <= MIN_CONFIG_BYTES {
        return Err(BackupError::NoConfigRetrieved);
    }

    let dir = backup_root.join(&device.directory);
    tokio::fs::create_dir_all(&dir).await?;

    let stamped = format!("{filename}-{}", Local::now().format("%Y-%m-%d-%H%M"));
    let path = dir.join(&stamped);
    if path.exists() {
        warn!("overwriting existing backup {}", path.display());
    }
    tokio::fs::write(&path, payload).await?;

    let written = tokio::fs::metadata(&path).await?.len();
    if written < payload.len() as u64 {
        warn!(
            "short write for {}: {written} of {} bytes",
            path.display(),
            payload.len()
        );
        return Err(BackupError::WriteVerificationFailed);
    }

    Ok(BackupRecord {
        device: device.id,
        btime: chrono::Utc::now().timestamp(),
        directory: device.directory.clone(),
        filename: stamped,
        config: payload.to_string(),
        last_change,
        last_user: last_user.to_string(),
    })
}

/// Drops backups older than the configured retention window, removing both
/// the records and the files they point at. File removal is best-effort; a
/// record whose file is already gone is not an error.
pub async fn run_retention(
    settings: &Settings,
    store: &dyn BackupStore,
) -> Result<usize, BackupError> {
    let days = i64::from(settings.retention_days_clamped());
    let horizon = chrono::Utc::now().timestamp() - days * 86_400;
    let purged = store.purge_older_than(horizon).await?;
    for record in &purged {
        let path = settings
            .backup_path
            .join(&record.directory)
            .join(&record.filename);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("could not remove expired backup {}: {e}", path.display());
        }
    }
    info!("retention removed {} backups older than {days} days", purged.len());
    Ok(purged.len())
}

//! Collaborator seams: device registry, backup store, run guard, mail.
//!
//! The orchestrator talks to its surroundings only through these traits,
//! so a deployment can back them with whatever database or mail relay it
//! has. The in-memory implementations here are complete enough for tests
//! and small single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;

use crate::config::RUN_STALE_SECS;
use crate::device::{BackupRecord, Credentials, Device, DeviceType};
use crate::error::BackupError;

/// Source of truth for devices, dialects and credentials, and the sink for
/// per-device bookkeeping written back during a run.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Devices to consider. `ids` narrows to an explicit set; `None` means
    /// every known device.
    async fn devices(&self, ids: Option<&[u64]>) -> Result<Vec<Device>, BackupError>;
    async fn device_type(&self, name: &str) -> Result<Option<DeviceType>, BackupError>;
    async fn credentials(&self, device: &Device) -> Result<Option<Credentials>, BackupError>;

    async fn set_last_attempt(&self, id: u64, when: i64) -> Result<(), BackupError>;
    async fn set_last_backup(&self, id: u64, when: i64) -> Result<(), BackupError>;
    async fn set_last_error(&self, id: u64, message: &str) -> Result<(), BackupError>;
    async fn set_last_change(&self, id: u64, when: i64, user: &str) -> Result<(), BackupError>;
    async fn set_hostname(&self, id: u64, hostname: &str) -> Result<(), BackupError>;
    /// Stores the base64 session transcript for post-mortem inspection.
    async fn set_debug(&self, id: u64, transcript: &str) -> Result<(), BackupError>;
}

/// Durable record of completed backups.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn append(&self, record: BackupRecord) -> Result<(), BackupError>;
    /// Removes records older than `horizon` and returns them so the caller
    /// can clean up the files they point at.
    async fn purge_older_than(&self, horizon: i64) -> Result<Vec<BackupRecord>, BackupError>;
}

/// Single-run guard for scheduled runs.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Claims the guard. A live claim younger than [`RUN_STALE_SECS`] wins
    /// unless `force` is set; a stale claim is noted and taken over.
    async fn acquire(&self, now: i64, force: bool) -> Result<(), BackupError>;
    async fn release(&self) -> Result<(), BackupError>;
}

/// Outbound notification channel.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), BackupError>;
}

/// In-memory registry backed by a mutexed device table.
#[derive(Default)]
pub struct MemoryRegistry {
    devices: Mutex<HashMap<u64, Device>>,
    dialects: Mutex<HashMap<String, DeviceType>>,
    credentials: Mutex<HashMap<u64, Credentials>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: Device, creds: Credentials) {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.id, creds);
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.id, device);
    }

    pub fn add_dialect(&self, dialect: DeviceType) {
        self.dialects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dialect.name.clone(), dialect);
    }

    pub fn device(&self, id: u64) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn update<F: FnOnce(&mut Device)>(&self, id: u64, f: F) -> Result<(), BackupError> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        match devices.get_mut(&id) {
            Some(device) => {
                f(device);
                Ok(())
            }
            None => Err(BackupError::Config(format!("unknown device id {id}"))),
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn devices(&self, ids: Option<&[u64]>) -> Result<Vec<Device>, BackupError> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Device> = match ids {
            Some(ids) => ids.iter().filter_map(|id| devices.get(id).cloned()).collect(),
            None => devices.values().cloned().collect(),
        };
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    async fn device_type(&self, name: &str) -> Result<Option<DeviceType>, BackupError> {
        let dialects = self.dialects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(dialects
            .get(name)
            .cloned()
            .or_else(|| crate::device::dialect(name)))
    }

    async fn credentials(&self, device: &Device) -> Result<Option<Credentials>, BackupError> {
        let creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        Ok(creds.get(&device.id).cloned())
    }

    async fn set_last_attempt(&self, id: u64, when: i64) -> Result<(), BackupError> {
        self.update(id, |d| d.last_attempt = when)
    }

    async fn set_last_backup(&self, id: u64, when: i64) -> Result<(), BackupError> {
        self.update(id, |d| d.last_backup = when)
    }

    async fn set_last_error(&self, id: u64, message: &str) -> Result<(), BackupError> {
        self.update(id, |d| d.last_error = message.to_string())
    }

    async fn set_last_change(&self, id: u64, when: i64, user: &str) -> Result<(), BackupError> {
        self.update(id, |d| {
            d.last_change = when;
            d.last_user = user.to_string();
        })
    }

    async fn set_hostname(&self, id: u64, hostname: &str) -> Result<(), BackupError> {
        self.update(id, |d| d.hostname = hostname.to_string())
    }

    async fn set_debug(&self, id: u64, transcript: &str) -> Result<(), BackupError> {
        self.update(id, |d| d.debug = transcript.to_string())
    }
}

/// In-memory backup record store.
#[derive(Default)]
pub struct MemoryBackupStore {
    records: Mutex<Vec<BackupRecord>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BackupRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn append(&self, record: BackupRecord) -> Result<(), BackupError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn purge_older_than(&self, horizon: i64) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let (old, keep): (Vec<_>, Vec<_>) =
            records.drain(..).partition(|r| r.btime < horizon);
        *records = keep;
        Ok(old)
    }
}

/// In-process run guard. Zero means unclaimed; otherwise the claim time.
#[derive(Default)]
pub struct MemoryRunLock {
    claimed_at: Mutex<i64>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn acquire(&self, now: i64, force: bool) -> Result<(), BackupError> {
        let mut claimed = self.claimed_at.lock().unwrap_or_else(|e| e.into_inner());
        if *claimed != 0 && !force {
            if now - *claimed < RUN_STALE_SECS {
                return Err(BackupError::RunInProgress(*claimed));
            }
            debug!("taking over stale run guard claimed at {}", *claimed);
        }
        *claimed = now;
        Ok(())
    }

    async fn release(&self) -> Result<(), BackupError> {
        *self.claimed_at.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        Ok(())
    }
}

/// Mail sender that records messages instead of delivering them.
#[derive(Default)]
pub struct MemoryMailSender {
    sent: Mutex<Vec<(String, String, String, String)>>,
}

impl MemoryMailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MailSender for MemoryMailSender {
    async fn send(
        &self,
        to: &str,
        from: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), BackupError> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((
            to.to_string(),
            from.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_guard_blocks_while_fresh() {
        let lock = MemoryRunLock::new();
        lock.acquire(1_000, false).await.expect("first claim");
        let err = lock.acquire(1_500, false).await.expect_err("still fresh");
        assert!(matches!(err, BackupError::RunInProgress(1_000)));
    }

    #[tokio::test]
    async fn run_guard_takes_over_stale_claims() {
        let lock = MemoryRunLock::new();
        lock.acquire(1_000, false).await.expect("first claim");
        lock.acquire(1_000 + RUN_STALE_SECS + 1, false)
            .await
            .expect("stale takeover");
    }

    #[tokio::test]
    async fn forced_claim_ignores_the_guard() {
        let lock = MemoryRunLock::new();
        lock.acquire(1_000, false).await.expect("first claim");
        lock.acquire(1_500, true).await.expect("forced");
    }

    #[tokio::test]
    async fn released_guard_can_be_claimed_again() {
        let lock = MemoryRunLock::new();
        lock.acquire(1_000, false).await.expect("first claim");
        lock.release().await.expect("release");
        lock.acquire(1_001, false).await.expect("second claim");
    }

    #[tokio::test]
    async fn explicit_id_list_returns_only_those_devices() {
        let registry = MemoryRegistry::new();
        for id in [1, 2, 3] {
            registry.add_device(
                Device::new(id, &format!("rtr{id}"), "192.0.2.1"),
                Credentials::default(),
            );
        }
        let picked = registry.devices(Some(&[3, 1])).await.expect("devices");
        let ids: Vec<u64> = picked.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn purge_splits_on_the_horizon() {
        let store = MemoryBackupStore::new();
        for btime in [100, 200, 300] {
            let mut record = BackupRecord::default();
            record.btime = btime;
            store.append(record).await.expect("append");
        }
        let purged = store.purge_older_than(250).await.expect("purge");
        assert_eq!(purged.len(), 2);
        assert_eq!(store.records().len(), 1);
    }
}

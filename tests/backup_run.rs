//! End-to-end backup runs against scripted device sessions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use confgrab::config::Settings;
use confgrab::device::{ConnectionType, Credentials, Device, DeviceType};
use confgrab::error::BackupError;
use confgrab::orchestrator::{Orchestrator, RunOptions};
use confgrab::registry::{
    MemoryBackupStore, MemoryMailSender, MemoryRegistry, MemoryRunLock, Registry, RunLock,
};
use confgrab::session::{SessionFactory, Transport, TransportKind};

/// A transport that answers each command with the next scripted chunk.
///
/// Replies are armed by `send`, so reads between commands come back empty
/// the way a quiet device would.
struct ScriptedTransport {
    replies: VecDeque<String>,
    pending: Option<String>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), BackupError> {
        Ok(())
    }

    async fn send(&mut self, _data: &str) -> Result<(), BackupError> {
        self.pending = self.replies.pop_front();
        Ok(())
    }

    async fn read_chunk(&mut self, _timeout: Duration) -> Result<Option<String>, BackupError> {
        Ok(self.pending.take())
    }

    async fn disconnect(&mut self, _graceful: bool) {}

    fn peer_ip(&self) -> &str {
        "192.0.2.10"
    }
}

/// Session factory handing out scripted transports and recording which
/// transport kinds were attempted.
struct ScriptedFactory {
    replies: Vec<String>,
    accept: Option<TransportKind>,
    attempts: Mutex<Vec<TransportKind>>,
}

impl ScriptedFactory {
    fn new(replies: &[&str], accept: Option<TransportKind>) -> Arc<Self> {
        Arc::new(Self {
            replies: replies.iter().map(|s| s.to_string()).collect(),
            accept,
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> Vec<TransportKind> {
        self.attempts.lock().expect("attempts lock").clone()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(
        &self,
        kind: TransportKind,
        device: &Device,
        _creds: &Credentials,
        _dialect: &DeviceType,
    ) -> Result<Box<dyn Transport>, BackupError> {
        self.attempts.lock().expect("attempts lock").push(kind);
        if let Some(accept) = self.accept
            && kind != accept
        {
            return Err(BackupError::Unreachable(device.address.clone()));
        }
        Ok(Box::new(ScriptedTransport {
            replies: self.replies.iter().cloned().collect(),
            pending: None,
        }))
    }
}

/// The dialog a cooperative device produces: enabled prompt, the two copy
/// questions, then the success marker.
const HAPPY_DIALOG: &[&str] = &[
    "\nrtr1#",
    "Address or name of remote host []? ",
    "Destination filename [rtr1]? ",
    "!!!\n1030 bytes copied in 2.1 secs\nrtr1#",
];

fn sample_config() -> String {
    let mut cfg = String::from(
        "!\n! Last configuration change at 12:01:03 UTC Tue Mar 4 2025 by admin\n!\nhostname rtr1\n",
    );
    for i in 0..10 {
        cfg.push_str(&format!(
            "interface GigabitEthernet0/{i}\n ip address 10.0.{i}.1 255.255.255.0\n"
        ));
    }
    cfg.push_str("end\n");
    cfg
}

fn plant_upload(backup_root: &Path, name: &str) {
    std::fs::write(backup_root.join(name), sample_config()).expect("plant upload");
}

struct Harness {
    _root: tempfile::TempDir,
    registry: Arc<MemoryRegistry>,
    store: Arc<MemoryBackupStore>,
    lock: Arc<MemoryRunLock>,
    mailer: Arc<MemoryMailSender>,
    orchestrator: Orchestrator,
}

fn harness(device: Device, factory: Arc<ScriptedFactory>, upload_present: bool) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir().expect("tempdir");
    if upload_present {
        plant_upload(root.path(), &device.hostname);
    }
    let settings = Settings {
        backup_path: root.path().to_path_buf(),
        transfer_server: "10.0.0.9".to_string(),
        email_to: "noc@example.net".to_string(),
        email_from: "backups@example.net".to_string(),
        ..Settings::default()
    };

    let registry = Arc::new(MemoryRegistry::new());
    registry.add_device(
        device,
        Credentials {
            username: "backup".to_string(),
            password: "secret".to_string(),
            enable_password: "enable-secret".to_string(),
        },
    );
    let store = Arc::new(MemoryBackupStore::new());
    let lock = Arc::new(MemoryRunLock::new());
    let mailer = Arc::new(MemoryMailSender::new());
    let orchestrator = Orchestrator::new(
        settings,
        registry.clone(),
        store.clone(),
        lock.clone(),
    )
    .with_mailer(mailer.clone())
    .with_session_factory(factory);

    Harness {
        _root: root,
        registry,
        store,
        lock,
        mailer,
        orchestrator,
    }
}

#[tokio::test]
async fn scheduled_run_backs_up_a_due_device() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, true);

    let report = h.orchestrator.run(RunOptions::default()).await?;
    assert_eq!(report.passed, vec!["rtr1".to_string()]);
    assert!(report.failed.is_empty());

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].device, 1);
    assert!(records[0].config.contains("hostname rtr1"));

    let device = h.registry.device(1).expect("device");
    assert!(device.last_backup > 0);
    assert!(device.last_attempt > 0);
    assert!(device.last_error.is_empty());
    assert!(!device.debug.is_empty());
    assert_eq!(device.last_user, "admin");

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].3.contains("rtr1"));
    Ok(())
}

#[tokio::test]
async fn missing_upload_fails_the_device() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, false);

    let report = h.orchestrator.run(RunOptions::default()).await.expect("run");
    assert!(report.passed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("no config uploaded"));

    assert!(h.store.records().is_empty());
    let device = h.registry.device(1).expect("device");
    assert_eq!(device.last_backup, 0);
    assert!(device.last_attempt > 0);
    assert!(device.last_error.contains("no config uploaded"));
}

#[tokio::test]
async fn telnet_only_device_never_attempts_ssh() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let mut device = Device::new(1, "rtr1", "192.0.2.10");
    device.connection_type = ConnectionType::Telnet;
    let h = harness(device, factory.clone(), true);

    h.orchestrator
        .run(RunOptions {
            devices: Some(vec![1]),
            ..RunOptions::default()
        })
        .await
        .expect("run");
    assert_eq!(factory.attempts(), vec![TransportKind::Telnet]);
}

#[tokio::test]
async fn ssh_is_tried_first_and_telnet_covers_a_refusal() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, Some(TransportKind::Telnet));
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory.clone(), true);

    let report = h.orchestrator.run(RunOptions::default()).await.expect("run");
    assert_eq!(report.passed.len(), 1);
    assert_eq!(
        factory.attempts(),
        vec![TransportKind::Ssh, TransportKind::Telnet]
    );
}

#[tokio::test]
async fn scheduled_run_respects_the_run_guard() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, true);

    h.lock
        .acquire(Utc::now().timestamp(), false)
        .await
        .expect("claim guard");
    let err = h
        .orchestrator
        .run(RunOptions::default())
        .await
        .expect_err("guard held");
    assert!(matches!(err, BackupError::RunInProgress(_)));
    assert!(h.store.records().is_empty());
}

#[tokio::test]
async fn forced_run_takes_over_a_held_guard() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, true);

    h.lock
        .acquire(Utc::now().timestamp(), false)
        .await
        .expect("claim guard");
    let report = h
        .orchestrator
        .run(RunOptions {
            force: true,
            ..RunOptions::default()
        })
        .await
        .expect("forced run");
    assert_eq!(report.passed.len(), 1);

    // The forced run released the guard on completion.
    h.lock
        .acquire(Utc::now().timestamp(), false)
        .await
        .expect("guard free again");
}

#[tokio::test]
async fn manual_run_bypasses_the_run_guard() {
    let factory = ScriptedFactory::new(HAPPY_DIALOG, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, true);

    h.lock
        .acquire(Utc::now().timestamp(), false)
        .await
        .expect("claim guard");
    let report = h
        .orchestrator
        .run(RunOptions {
            devices: Some(vec![1]),
            ..RunOptions::default()
        })
        .await
        .expect("manual run");
    assert_eq!(report.passed.len(), 1);
}

#[tokio::test]
async fn exhausted_dialog_still_checks_the_landing_area() {
    // A device that chatters without ever answering the copy dialog; the
    // upload made it to the landing area regardless.
    let mut dialog = vec!["\nrtr1#"];
    dialog.extend(std::iter::repeat_n("Writing rtr1 !!!\nrtr1#", 35));
    let factory = ScriptedFactory::new(&dialog, None);
    let h = harness(Device::new(1, "rtr1", "192.0.2.10"), factory, true);

    let report = h.orchestrator.run(RunOptions::default()).await.expect("run");
    assert_eq!(report.passed, vec!["rtr1".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(h.store.records().len(), 1);
}

/// Registry whose device listing is unavailable.
struct OfflineRegistry;

#[async_trait]
impl Registry for OfflineRegistry {
    async fn devices(&self, _ids: Option<&[u64]>) -> Result<Vec<Device>, BackupError> {
        Err(BackupError::Config("registry offline".to_string()))
    }

    async fn device_type(&self, _name: &str) -> Result<Option<DeviceType>, BackupError> {
        Ok(None)
    }

    async fn credentials(&self, _device: &Device) -> Result<Option<Credentials>, BackupError> {
        Ok(None)
    }

    async fn set_last_attempt(&self, _id: u64, _when: i64) -> Result<(), BackupError> {
        Ok(())
    }

    async fn set_last_backup(&self, _id: u64, _when: i64) -> Result<(), BackupError> {
        Ok(())
    }

    async fn set_last_error(&self, _id: u64, _message: &str) -> Result<(), BackupError> {
        Ok(())
    }

    async fn set_last_change(&self, _id: u64, _when: i64, _user: &str) -> Result<(), BackupError> {
        Ok(())
    }

    async fn set_hostname(&self, _id: u64, _hostname: &str) -> Result<(), BackupError> {
        Ok(())
    }

    async fn set_debug(&self, _id: u64, _transcript: &str) -> Result<(), BackupError> {
        Ok(())
    }
}

#[tokio::test]
async fn failed_device_listing_releases_the_run_guard() {
    let root = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        backup_path: root.path().to_path_buf(),
        transfer_server: "10.0.0.9".to_string(),
        ..Settings::default()
    };
    let lock = Arc::new(MemoryRunLock::new());
    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(OfflineRegistry),
        Arc::new(MemoryBackupStore::new()),
        lock.clone(),
    );

    let err = orchestrator
        .run(RunOptions::default())
        .await
        .expect_err("listing failed");
    assert!(matches!(err, BackupError::Config(_)));

    lock.acquire(Utc::now().timestamp(), false)
        .await
        .expect("guard released");
}

#[tokio::test]
async fn config_hostname_renames_the_device() {
    // The upload lands under the old name, but the config body says the
    // device now calls itself rtr1.
    let dialog = &[
        "\noldname#",
        "Address or name of remote host []? ",
        "Destination filename [oldname]? ",
        "!!!\n1030 bytes copied in 2.1 secs\noldname#",
    ];
    let factory = ScriptedFactory::new(dialog, None);
    let h = harness(Device::new(1, "oldname", "192.0.2.10"), factory, true);

    let report = h.orchestrator.run(RunOptions::default()).await.expect("run");
    assert_eq!(report.passed.len(), 1);

    let device = h.registry.device(1).expect("device");
    assert_eq!(device.hostname, "rtr1");

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].filename.starts_with("rtr1-"));
}

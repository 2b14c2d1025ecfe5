//! Run orchestration: device selection, the per-device pipeline, and the
//! run-level guard, retention and notification plumbing.
//!
//! A run walks its selected devices sequentially. Every device failure is
//! recorded and skipped past; only run-level preconditions (settings, the
//! single-run guard) abort a run outright.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Utc;
use log::{debug, info, warn};

use crate::config::{RETRY_WINDOW_SECS, SCHEDULE_GRACE_SECS, Settings};
use crate::device::{Credentials, Device, DeviceType};
use crate::error::BackupError;
use crate::fetch::{change_time_from_uptime, fetch_config, scan_config};
use crate::registry::{BackupStore, MailSender, Registry, RunLock};
use crate::session::{CommandChannel, NetSessionFactory, SessionFactory, Transport, TransportKind};
use crate::store::{run_retention, save_backup};
use crate::transfer::{TransferReport, run_transfer};

/// What kind of run to perform.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit device ids to back up. Bypasses the schedule filter and the
    /// single-run guard; disabled devices in the list are still processed.
    pub devices: Option<Vec<u64>>,
    /// Retry pass: skip devices already attempted within the retry window.
    pub retry: bool,
    /// Claim the run guard even if another run appears active.
    pub force: bool,
}

/// Outcome of a completed run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Hostnames backed up successfully, in processing order.
    pub passed: Vec<String>,
    /// Hostname and error message for each failed device.
    pub failed: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Renders the notification body.
    pub fn compose_body(&self) -> String {
        let mut body = format!(
            "Configuration backup run completed in {} seconds.\n",
            self.elapsed.as_secs()
        );
        if !self.passed.is_empty() {
            body.push_str("\nThese devices backed up successfully:\n");
            for host in &self.passed {
                body.push_str(host);
                body.push('\n');
            }
        }
        if !self.failed.is_empty() {
            body.push_str("\nThese devices failed to back up:\n");
            for (host, err) in &self.failed {
                body.push_str(&format!("{host}: {err}\n"));
            }
        }
        body.push_str(&format!(
            "\n{} succeeded, {} failed.\n",
            self.passed.len(),
            self.failed.len()
        ));
        body
    }
}

/// Whether a device is due in a scheduled (non-manual) run.
///
/// A device is due once its last backup is older than its schedule interval
/// plus a grace period, so a run that starts slightly early does not skip
/// the whole cycle. Retry passes additionally skip devices attempted within
/// the retry window.
fn select_for_run(device: &Device, now: i64, retry: bool) -> bool {
    if !device.enabled {
        return false;
    }
    if now - device.schedule_days * 86_400 - SCHEDULE_GRACE_SECS <= device.last_backup {
        return false;
    }
    !retry || now - device.last_attempt > RETRY_WINDOW_SECS
}

/// Drives backup runs against the configured collaborators.
pub struct Orchestrator {
    settings: Settings,
    registry: Arc<dyn Registry>,
    store: Arc<dyn BackupStore>,
    lock: Arc<dyn RunLock>,
    mailer: Option<Arc<dyn MailSender>>,
    sessions: Arc<dyn SessionFactory>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        registry: Arc<dyn Registry>,
        store: Arc<dyn BackupStore>,
        lock: Arc<dyn RunLock>,
    ) -> Self {
        Self {
            settings,
            registry,
            store,
            lock,
            mailer: None,
            sessions: Arc::new(NetSessionFactory),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_session_factory(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Runs a backup pass and returns its report.
    ///
    /// Manual runs (an explicit device list) bypass the schedule filter and
    /// the single-run guard; scheduled runs claim the guard first and
    /// release it at the end whether or not devices failed.
    pub async fn run(&self, opts: RunOptions) -> Result<RunReport, BackupError> {
        self.settings.validate()?;
        let started = Instant::now();
        let now = Utc::now().timestamp();
        let manual = opts.devices.is_some();

        if !manual {
            self.lock.acquire(now, opts.force).await?;
        }

        let candidates = match self.registry.devices(opts.devices.as_deref()).await {
            Ok(candidates) => candidates,
            Err(err) => {
                // Do not leave the guard held until the staleness override.
                if !manual
                    && let Err(release_err) = self.lock.release().await
                {
                    warn!("could not release run guard: {release_err}");
                }
                return Err(err);
            }
        };
        let selected: Vec<Device> = if manual {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|d| select_for_run(d, now, opts.retry))
                .collect()
        };
        info!("backing up {} devices", selected.len());

        let mut report = RunReport::default();
        for device in &selected {
            match self.backup_device(device).await {
                Ok(()) => {
                    info!("{} backed up", device.hostname);
                    report.passed.push(device.hostname.clone());
                }
                Err(err) => {
                    warn!("{} backup failed: {err}", device.hostname);
                    report.failed.push((device.hostname.clone(), err.to_string()));
                }
            }
        }
        report.elapsed = started.elapsed();

        if report.failed.is_empty() {
            info!(
                "backup run complete, all {} devices succeeded",
                report.passed.len()
            );
        } else {
            warn!(
                "backup run complete, {} of {} devices failed",
                report.failed.len(),
                report.passed.len() + report.failed.len()
            );
        }

        self.send_summary(&report, opts.retry).await;

        if let Err(err) = run_retention(&self.settings, self.store.as_ref()).await {
            warn!("retention sweep failed: {err}");
        }

        if !manual {
            self.lock.release().await?;
        }

        info!(
            "STATS: {} devices in {} seconds, {} ok, {} failed",
            report.passed.len() + report.failed.len(),
            report.elapsed.as_secs(),
            report.passed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Mails the run summary when a recipient and a sender are configured.
    ///
    /// A retry pass that touched no devices stays quiet; everything else
    /// reports, including an all-failed run.
    async fn send_summary(&self, report: &RunReport, retry: bool) {
        let Some(mailer) = &self.mailer else { return };
        if self.settings.email_to.is_empty() {
            return;
        }
        if retry && report.passed.is_empty() && report.failed.is_empty() {
            return;
        }
        let name = if self.settings.email_from_name.is_empty() {
            "Config Backups"
        } else {
            &self.settings.email_from_name
        };
        let from = format!("{name} <{}>", self.settings.email_from);
        let mut subject = if report.failed.is_empty() {
            "Network device configuration backups".to_string()
        } else {
            format!(
                "Network device configuration backups, {} failed",
                report.failed.len()
            )
        };
        if retry {
            subject.push_str(" - Reattempt");
        }
        if let Err(err) = mailer
            .send(&self.settings.email_to, &from, &subject, &report.compose_body())
            .await
        {
            warn!("could not send summary mail: {err}");
        }
    }

    /// The full per-device pipeline: connect, enable, transfer, fetch,
    /// scan, persist. Bookkeeping (attempt time, last error, transcript) is
    /// written back whatever the outcome.
    async fn backup_device(&self, device: &Device) -> Result<(), BackupError> {
        let now = Utc::now().timestamp();
        self.registry.set_last_attempt(device.id, now).await?;

        let creds = match self.registry.credentials(device).await? {
            Some(creds) => creds,
            None => {
                let err = BackupError::Config(format!("no credentials for {}", device.hostname));
                self.registry
                    .set_last_error(device.id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };
        let dialect = self
            .registry
            .device_type(&device.device_type)
            .await?
            .unwrap_or_default();

        let transport = match self.try_connect(device, &creds, &dialect).await {
            Ok(transport) => transport,
            Err(err) => {
                self.registry
                    .set_last_error(device.id, &err.to_string())
                    .await?;
                return Err(err);
            }
        };
        let mut channel = CommandChannel::new(transport, &dialect, self.settings.debug_buffer);

        let result = self
            .drive_session(&mut channel, device, &creds, &dialect, now)
            .await;

        let transcript = BASE64_STANDARD.encode(channel.transcript());
        self.registry.set_debug(device.id, &transcript).await?;
        channel.close().await;

        match result {
            Ok(()) => {
                self.registry.set_last_error(device.id, "").await?;
                Ok(())
            }
            Err(err) => {
                self.registry
                    .set_last_error(device.id, &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }

    /// Opens a session over the first transport the device permits that
    /// accepts the connection: SSH first, then Telnet.
    async fn try_connect(
        &self,
        device: &Device,
        creds: &Credentials,
        dialect: &DeviceType,
    ) -> Result<Box<dyn Transport>, BackupError> {
        let mut last_err = BackupError::TransportUnsupported;
        if device.connection_type.allows_ssh() {
            match self
                .sessions
                .open(TransportKind::Ssh, device, creds, dialect)
                .await
            {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    debug!("{} ssh connect failed: {err}", device.hostname);
                    last_err = err;
                }
            }
        }
        if device.connection_type.allows_telnet() {
            match self
                .sessions
                .open(TransportKind::Telnet, device, creds, dialect)
                .await
            {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    debug!("{} telnet connect failed: {err}", device.hostname);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn drive_session(
        &self,
        channel: &mut CommandChannel,
        device: &Device,
        creds: &Credentials,
        dialect: &DeviceType,
        now: i64,
    ) -> Result<(), BackupError> {
        channel
            .ensure_enabled(&dialect.enable_cmd, &creds.enable_password)
            .await?;

        let transfer_name = device.hostname.clone();
        let claimed = run_transfer(
            channel,
            dialect,
            &self.settings.transfer_server,
            &transfer_name,
        )
        .await?;
        if claimed != TransferReport::Success {
            // The dialog's word is advisory; the landing area decides.
            debug!(
                "{} dialog ended {claimed:?}, checking for the file anyway",
                device.hostname
            );
        }

        let data =
            fetch_config(&self.settings.backup_path, &transfer_name, dialect.check_end).await?;
        let facts = scan_config(&data);

        let mut save_name = device.hostname.clone();
        if let Some(found) = &facts.hostname
            && !found.is_empty()
            && *found != device.hostname
        {
            info!("{} reports hostname {found}, renaming", device.hostname);
            self.registry.set_hostname(device.id, found).await?;
            save_name = found.clone();
        }

        let mut change = facts.last_change;
        if change.is_none() && !dialect.version_cmd.is_empty() {
            change =
                change_time_from_uptime(channel, &dialect.version_cmd, now, device.last_change)
                    .await?;
        }
        let (last_change, last_user) = match change {
            Some((when, user)) => {
                if when != device.last_change {
                    self.registry.set_last_change(device.id, when, &user).await?;
                }
                (when, user)
            }
            None => (device.last_change, device.last_user.clone()),
        };

        let record = save_backup(
            &self.settings.backup_path,
            device,
            &save_name,
            &data,
            last_change,
            &last_user,
        )
        .await?;
        self.registry.set_last_backup(device.id, record.btime).await?;
        self.store.append(record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn due_device(now: i64) -> Device {
        let mut device = Device::new(1, "rtr1", "192.0.2.1");
        device.schedule_days = 1;
        device.last_backup = now - 86_400 - SCHEDULE_GRACE_SECS - 1;
        device
    }

    #[test]
    fn overdue_device_is_selected() {
        let now = 1_000_000_000;
        assert!(select_for_run(&due_device(now), now, false));
    }

    #[test]
    fn recently_backed_up_device_is_not_selected() {
        let now = 1_000_000_000;
        let mut device = due_device(now);
        device.last_backup = now - 3_600;
        assert!(!select_for_run(&device, now, false));
    }

    #[test]
    fn grace_period_holds_back_a_barely_due_device() {
        let now = 1_000_000_000;
        let mut device = due_device(now);
        device.last_backup = now - 86_400 - 10;
        assert!(!select_for_run(&device, now, false));
    }

    #[test]
    fn disabled_device_is_never_selected() {
        let now = 1_000_000_000;
        let mut device = due_device(now);
        device.enabled = false;
        assert!(!select_for_run(&device, now, false));
    }

    #[test]
    fn retry_pass_skips_recent_attempts() {
        let now = 1_000_000_000;
        let mut device = due_device(now);
        device.last_attempt = now - 60;
        assert!(select_for_run(&device, now, false));
        assert!(!select_for_run(&device, now, true));
        device.last_attempt = now - RETRY_WINDOW_SECS - 1;
        assert!(select_for_run(&device, now, true));
    }

    #[test]
    fn report_body_lists_both_outcomes() {
        let report = RunReport {
            passed: vec!["rtr1".to_string()],
            failed: vec![("rtr2".to_string(), "login failed".to_string())],
            elapsed: Duration::from_secs(12),
        };
        let body = report.compose_body();
        assert!(body.contains("These devices backed up successfully:\nrtr1\n"));
        assert!(body.contains("These devices failed to back up:\nrtr2: login failed\n"));
        assert!(body.contains("1 succeeded, 1 failed."));
    }

    #[test]
    fn empty_report_body_has_no_sections() {
        let body = RunReport::default().compose_body();
        assert!(!body.contains("successfully"));
        assert!(!body.contains("failed to back up"));
        assert!(body.contains("0 succeeded, 0 failed."));
    }
}

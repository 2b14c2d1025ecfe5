//! Automated configuration backups for network devices.
//!
//! `confgrab` logs into routers, switches and firewalls over SSH or Telnet,
//! raises the session to a privileged prompt, drives the vendor's
//! copy-to-server dialog to upload the running configuration to a transfer
//! (TFTP) server, then validates and archives the uploaded file. A run
//! orchestrator handles scheduling, a single-run guard, retention of old
//! backups, and a summary notification.
//!
//! # Features
//!
//! - SSH and Telnet transports with automatic fallback per device
//! - Vendor dialects (prompts, copy command, confirmation quirks) as data
//! - Prompt-driven command channel with bounded dialog loops
//! - Change detection from config stamps, with a device-uptime fallback
//! - Pluggable registry, store, run guard and mail seams for embedding
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use confgrab::config::Settings;
//! use confgrab::device::{Credentials, Device};
//! use confgrab::orchestrator::{Orchestrator, RunOptions};
//! use confgrab::registry::{MemoryBackupStore, MemoryRegistry, MemoryRunLock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), confgrab::error::BackupError> {
//!     let settings = Settings::load()?;
//!
//!     let registry = Arc::new(MemoryRegistry::new());
//!     let mut device = Device::new(1, "rtr1", "192.0.2.10");
//!     device.device_type = "cisco-ios".to_string();
//!     registry.add_device(
//!         device,
//!         Credentials {
//!             username: "backup".to_string(),
//!             password: "secret".to_string(),
//!             enable_password: "enable-secret".to_string(),
//!         },
//!     );
//!
//!     let orchestrator = Orchestrator::new(
//!         settings,
//!         registry,
//!         Arc::new(MemoryBackupStore::new()),
//!         Arc::new(MemoryRunLock::new()),
//!     );
//!     let report = orchestrator.run(RunOptions::default()).await?;
//!     println!("{}", report.compose_body());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod store;
pub mod transfer;

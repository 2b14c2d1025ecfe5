//! Device session transports and the prompt-driven command channel.
//!
//! Network devices speak no structured protocol over their management
//! connections: everything is free-text terminal output whose shape depends
//! on the vendor dialect. This module provides the two byte-stream
//! transports (SSH and Telnet), the prompt classifier that decides when the
//! device is ready for the next command, and the [`CommandChannel`] that
//! drives timed command/response exchanges on top of either transport.
//!
//! # Main Components
//!
//! - [`Transport`] - capability interface a byte-stream session must provide
//! - [`SshTransport`] / [`TelnetTransport`] - the two variants
//! - [`CommandChannel`] - send a command, await a recognizable prompt
//! - [`SessionFactory`] - seam the orchestrator opens sessions through

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::{Credentials, Device, DeviceType};
use crate::error::BackupError;

pub use channel::{CmdStatus, CommandChannel, EnableState};
pub use ssh::SshTransport;
pub use telnet::TelnetTransport;

mod channel;
mod ssh;
mod telnet;

/// Matches a normal (unprivileged) prompt: identifier followed by `>`.
pub static NORMAL_PROMPT: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"[a-zA-Z0-9\-_]>[ ]*$") {
        Ok(re) => re,
        Err(err) => panic!("invalid NORMAL_PROMPT regex: {err}"),
    });

/// Matches an enabled (privileged) prompt: identifier followed by `#`.
pub static ENABLED_PROMPT: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"[a-zA-Z0-9\-_]#[ ]*$") {
        Ok(re) => re,
        Err(err) => panic!("invalid ENABLED_PROMPT regex: {err}"),
    });

/// Matches a generic sub-prompt: identifier followed by `:`.
pub static COLON_PROMPT: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"[a-zA-Z0-9\-_]:[ ]*$") {
        Ok(re) => re,
        Err(err) => panic!("invalid COLON_PROMPT regex: {err}"),
    });

/// The kind of prompt a line of output ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Unprivileged command prompt (trailing `>`).
    Normal,
    /// Privileged command prompt (trailing `#`).
    Enabled,
    /// The dialect's password prompt fragment.
    Password,
    /// Generic interactive sub-prompt (trailing `:`).
    Colon,
}

/// Classifies a line against the known prompt patterns, in priority order.
pub fn classify_prompt(line: &str, password_prompt: &str) -> Option<PromptKind> {
    if NORMAL_PROMPT.is_match(line) {
        return Some(PromptKind::Normal);
    }
    if ENABLED_PROMPT.is_match(line) {
        return Some(PromptKind::Enabled);
    }
    if !password_prompt.is_empty()
        && line
            .to_ascii_lowercase()
            .contains(&password_prompt.to_ascii_lowercase())
    {
        return Some(PromptKind::Password);
    }
    if COLON_PROMPT.is_match(line) {
        return Some(PromptKind::Colon);
    }
    None
}

/// Concrete transport chosen for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ssh,
    Telnet,
}

/// A byte-stream session to a device.
///
/// Implementations own connection establishment including device login, so
/// that a successfully connected transport is sitting at a command prompt.
#[async_trait]
pub trait Transport: Send {
    /// Opens the connection and completes the login sequence.
    async fn connect(&mut self) -> Result<(), BackupError>;

    /// Sends raw input to the device.
    async fn send(&mut self, data: &str) -> Result<(), BackupError>;

    /// Reads the next chunk of output, `None` if nothing arrived in time.
    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<String>, BackupError>;

    /// Closes the session; when `graceful`, a polite `exit` is sent first.
    async fn disconnect(&mut self, graceful: bool);

    /// Resolved numeric address of the peer.
    fn peer_ip(&self) -> &str;
}

/// Resolves a device address to a numeric IP.
///
/// Dotted-quad input passes through untouched; anything else goes through
/// the resolver. An address that does not resolve refuses to connect.
pub async fn resolve_address(address: &str) -> Result<String, BackupError> {
    if address.is_empty() {
        return Err(BackupError::UnknownHost("(empty address)".to_string()));
    }
    if address.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Ok(address.to_string());
    }
    let mut resolved = tokio::net::lookup_host((address, 0u16))
        .await
        .map_err(|_| BackupError::UnknownHost(address.to_string()))?;
    match resolved.next() {
        Some(addr) => Ok(addr.ip().to_string()),
        None => Err(BackupError::UnknownHost(address.to_string())),
    }
}

/// Opens connected device sessions; injectable so tests can script dialogs.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Resolves, connects, and logs in over the given transport kind.
    async fn open(
        &self,
        kind: TransportKind,
        device: &Device,
        creds: &Credentials,
        dialect: &DeviceType,
    ) -> Result<Box<dyn Transport>, BackupError>;
}

/// The production factory, backed by real SSH and Telnet connections.
pub struct NetSessionFactory;

#[async_trait]
impl SessionFactory for NetSessionFactory {
    async fn open(
        &self,
        kind: TransportKind,
        device: &Device,
        creds: &Credentials,
        dialect: &DeviceType,
    ) -> Result<Box<dyn Transport>, BackupError> {
        let ip = resolve_address(&device.address).await?;
        debug!("{ip} -> opening {kind:?} session");
        let mut transport: Box<dyn Transport> = match kind {
            TransportKind::Ssh => Box::new(SshTransport::new(&ip, creds.clone())),
            TransportKind::Telnet => Box::new(TelnetTransport::new(&ip, creds.clone(), dialect)),
        };
        transport.connect().await?;
        Ok(transport)
    }
}

//! Telnet transport over a raw TCP socket.
//!
//! Opens port 23, sends a fixed option-negotiation preamble (we announce an
//! XTERM terminal and refuse everything the server would like to negotiate),
//! then walks the free-text login dialog: wait for the username prompt, send
//! the username, wait for the password prompt, send the password, and check
//! that the device moved past the pre-login prompt.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use super::Transport;
use crate::config::{PROMPT_MAX_ROUNDS, READ_TIMEOUT, SETTLE_DELAY};
use crate::device::{Credentials, DeviceType, mask};
use crate::error::BackupError;

/// IAC WILL/DO announcements plus terminal-type and speed subnegotiation.
const OPTION_PREAMBLE: &[u8] = &[
    0xFF, 0xFB, 0x1F, 0xFF, 0xFB, 0x20, 0xFF, 0xFB, 0x18, 0xFF, 0xFB, 0x27, 0xFF, 0xFD, 0x01,
    0xFF, 0xFB, 0x03, 0xFF, 0xFD, 0x03, 0xFF, 0xFC, 0x23, 0xFF, 0xFC, 0x24, 0xFF, 0xFA, 0x1F,
    0x00, 0x50, 0x00, 0x18, 0xFF, 0xF0, 0xFF, 0xFA, 0x20, 0x00, 0x33, 0x38, 0x34, 0x30, 0x30,
    0x2C, 0x33, 0x38, 0x34, 0x30, 0x30, 0xFF, 0xF0, 0xFF, 0xFA, 0x27, 0x00, 0xFF, 0xF0, 0xFF,
    0xFA, 0x18, 0x00, 0x58, 0x54, 0x45, 0x52, 0x4D, 0xFF, 0xF0,
];

/// IAC WONT/DONT refusals for echo, linemode, and status options.
const OPTION_REFUSALS: &[u8] = &[
    0xFF, 0xFC, 0x01, 0xFF, 0xFC, 0x22, 0xFF, 0xFE, 0x05, 0xFF, 0xFC, 0x21,
];

/// Removes in-band IAC negotiation sequences; they are not terminal text.
fn strip_iac(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == 0xFF {
            // IAC SB ... IAC SE, or a three-byte option command.
            if raw.get(i + 1) == Some(&0xFA) {
                i += 2;
                while i < raw.len() && !(raw[i] == 0xFF && raw.get(i + 1) == Some(&0xF0)) {
                    i += 1;
                }
                i += 2;
            } else {
                i += 3;
            }
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

/// Telnet session transport. Lives for a single backup attempt.
pub struct TelnetTransport {
    address: String,
    port: u16,
    creds: Credentials,
    username_prompt: String,
    password_prompt: String,
    stream: Option<TcpStream>,
}

impl TelnetTransport {
    /// Prepares a transport for the resolved address; call `connect` to use.
    pub fn new(address: &str, creds: Credentials, dialect: &DeviceType) -> Self {
        Self {
            address: address.to_string(),
            port: 23,
            creds,
            username_prompt: dialect.username_prompt.to_ascii_lowercase(),
            password_prompt: dialect.password_prompt.to_ascii_lowercase(),
            stream: None,
        }
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<(), BackupError> {
        let stream = self.stream.as_mut().ok_or(BackupError::ChannelClosed)?;
        stream.write_all(data).await?;
        Ok(())
    }

    /// Drains whatever the device has to say right now.
    async fn read_burst(&mut self) -> Result<String, BackupError> {
        let mut collected = String::new();
        while let Some(chunk) = self.read_chunk(READ_TIMEOUT).await? {
            collected.push_str(&chunk);
        }
        Ok(collected)
    }

    /// Waits for the password prompt, nudging is not needed after a username.
    async fn await_password_prompt(&mut self) -> Result<String, BackupError> {
        let mut seen = String::new();
        for _ in 0..PROMPT_MAX_ROUNDS {
            sleep(SETTLE_DELAY).await;
            seen.push_str(&self.read_burst().await?);
            if seen.to_ascii_lowercase().contains(&self.password_prompt) {
                return Ok(seen);
            }
        }
        Err(BackupError::AuthFailed)
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn connect(&mut self) -> Result<(), BackupError> {
        debug!("{} -> attempting to open socket on port {}", self.address, self.port);
        let stream = TcpStream::connect((self.address.as_str(), self.port))
            .await
            .map_err(|err| BackupError::Unreachable(format!("{}: {err}", self.address)))?;
        self.stream = Some(stream);

        self.send_raw(OPTION_PREAMBLE).await?;
        sleep(SETTLE_DELAY).await;
        self.send_raw(OPTION_REFUSALS).await?;
        sleep(SETTLE_DELAY).await;

        // Nudge with bare returns until the username prompt shows up.
        let mut seen = self.read_burst().await?;
        let mut found = false;
        for round in 0..PROMPT_MAX_ROUNDS {
            if seen.to_ascii_lowercase().contains("access not permitted") {
                debug!("{} access not permitted", self.address);
                self.disconnect(false).await;
                return Err(BackupError::AccessDenied);
            }
            if seen.to_ascii_lowercase().contains(&self.username_prompt) {
                found = true;
                break;
            }
            debug!("{} no username prompt received ({round})", self.address);
            self.send_raw(b"\r").await?;
            sleep(SETTLE_DELAY).await;
            seen.push_str(&self.read_burst().await?);
        }
        if !found {
            self.disconnect(false).await;
            return Err(BackupError::DialogTimeout(PROMPT_MAX_ROUNDS));
        }

        debug!("{} sending username: {}", self.address, self.creds.username);
        let username = format!("{}\r", self.creds.username);
        self.send_raw(username.as_bytes()).await?;

        let seen = match self.await_password_prompt().await {
            Ok(seen) => seen,
            Err(err) => {
                self.disconnect(false).await;
                return Err(err);
            }
        };

        // Remember the pre-login prompt; seeing it again after the password
        // means the device rejected us.
        let login_prompt = seen
            .lines()
            .next_back()
            .unwrap_or("")
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        debug!(
            "{} found prompt '{}', sending password: {}",
            self.address,
            login_prompt,
            mask(&self.creds.password)
        );
        let password = format!("{}\r", self.creds.password);
        self.send_raw(password.as_bytes()).await?;
        sleep(SETTLE_DELAY).await;

        let reply = self.read_burst().await?;
        let last = reply.lines().next_back().unwrap_or("").trim();
        if last.is_empty() || (!login_prompt.is_empty() && last == login_prompt) {
            debug!("{} login failed, disconnecting", self.address);
            self.disconnect(false).await;
            return Err(BackupError::AuthFailed);
        }
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), BackupError> {
        self.send_raw(data.as_bytes()).await
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<String>, BackupError> {
        let stream = self.stream.as_mut().ok_or(BackupError::ChannelClosed)?;
        let mut buf = [0u8; 4096];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(BackupError::ChannelClosed),
            Ok(Ok(n)) => Ok(Some(
                String::from_utf8_lossy(&strip_iac(&buf[..n])).into_owned(),
            )),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    async fn disconnect(&mut self, graceful: bool) {
        if graceful {
            let _ = self.send_raw(b"exit\r").await;
            sleep(Duration::from_millis(100)).await;
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        debug!("{} telnet session closed", self.address);
    }

    fn peer_ip(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::strip_iac;

    #[test]
    fn iac_option_commands_are_removed() {
        let raw = [0xFF, 0xFD, 0x01, b'U', b's', b'e', b'r', b':'];
        assert_eq!(strip_iac(&raw), b"User:");
    }

    #[test]
    fn iac_subnegotiation_blocks_are_removed() {
        let raw = [
            0xFF, 0xFA, 0x18, 0x00, b'X', 0xFF, 0xF0, b'o', b'k',
        ];
        assert_eq!(strip_iac(&raw), b"ok");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_iac(b"router1>"), b"router1>");
    }
}

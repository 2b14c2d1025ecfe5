//! Prompt-driven command channel and enable-mode escalation.
//!
//! [`CommandChannel`] turns a raw [`Transport`] into a command/response
//! exchange: write the command, settle briefly, then read until a
//! recognizable prompt appears, the device goes quiet, or the response
//! window elapses. Secrets passed as `masked` are redacted from the
//! accumulated transcript before anything is logged or buffered.

use log::{debug, trace};
use tokio::time::{Instant, sleep};

use super::{ENABLED_PROMPT, NORMAL_PROMPT, Transport, classify_prompt};
use crate::config::{PROMPT_MAX_ROUNDS, READ_TIMEOUT, SETTLE_DELAY};
use crate::device::DeviceType;
use crate::error::BackupError;

/// Replacement text for redacted secrets in transcripts.
const MASKED_SECRET: &str = "__password__";

/// Outcome of one command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// A recognizable prompt arrived, or the device finished talking.
    Complete,
    /// The response window elapsed. Retryable, not fatal.
    Timeout,
}

/// Privilege level the session has been observed at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnableState {
    #[default]
    Unknown,
    /// Unprivileged prompt (`>`); no escalation attempted or possible.
    Normal,
    /// Privileged prompt (`#`) reached; terminal.
    Enabled,
    /// Escalation was attempted and did not reach a privileged prompt.
    Failed,
}

/// Returns the final (possibly partial) line of accumulated output.
fn last_line(data: &str) -> &str {
    data.rsplit('\n').next().unwrap_or("").trim_end_matches('\r')
}

/// Echo suppression: keeps at most the final `n` logical lines.
fn tail_lines(data: &str, n: usize) -> String {
    let lines: Vec<&str> = data.lines().collect();
    if lines.len() <= n {
        data.to_string()
    } else {
        lines[lines.len() - n..].join("\n")
    }
}

/// A command/response channel over a connected transport.
pub struct CommandChannel {
    transport: Box<dyn Transport>,
    password_prompt: String,
    transcript: String,
    debug_buffer: bool,
    enable_state: EnableState,
}

impl CommandChannel {
    pub fn new(transport: Box<dyn Transport>, dialect: &DeviceType, debug_buffer: bool) -> Self {
        Self {
            transport,
            password_prompt: dialect.password_prompt.clone(),
            transcript: String::new(),
            debug_buffer,
            enable_state: EnableState::Unknown,
        }
    }

    pub fn peer_ip(&self) -> &str {
        self.transport.peer_ip()
    }

    /// Everything read on this channel, secrets already redacted.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn enable_state(&self) -> EnableState {
        self.enable_state
    }

    /// Sends a command and returns the echo-suppressed response (the final
    /// two logical lines).
    pub async fn do_command(
        &mut self,
        cmd: &str,
        masked: Option<&str>,
    ) -> Result<(CmdStatus, String), BackupError> {
        let (status, full) = self.do_command_full(cmd, masked).await?;
        Ok((status, tail_lines(&full, 2)))
    }

    /// Sends a command and returns the full response. Used where the body of
    /// the output matters (version/uptime scraping), not just the prompt.
    pub async fn do_command_full(
        &mut self,
        cmd: &str,
        masked: Option<&str>,
    ) -> Result<(CmdStatus, String), BackupError> {
        let shown = match masked {
            Some(secret) if !secret.is_empty() && cmd.contains(secret) => MASKED_SECRET,
            _ => cmd,
        };
        trace!("{} -> sending '{}'", self.peer_ip(), shown);
        self.transport.send(&format!("{cmd}\n")).await?;
        sleep(SETTLE_DELAY).await;
        self.collect_response(masked).await
    }

    /// Continues reading without writing anything, for dialogs where the
    /// device is still producing output (e.g. a command echo not yet
    /// followed by its result).
    pub async fn read_more(
        &mut self,
        masked: Option<&str>,
    ) -> Result<(CmdStatus, String), BackupError> {
        let (status, full) = self.collect_response(masked).await?;
        Ok((status, tail_lines(&full, 2)))
    }

    async fn collect_response(
        &mut self,
        masked: Option<&str>,
    ) -> Result<(CmdStatus, String), BackupError> {
        let started = Instant::now();
        let mut data = String::new();
        loop {
            match self.transport.read_chunk(READ_TIMEOUT).await? {
                Some(chunk) => {
                    let chunk = match masked {
                        Some(secret) if !secret.is_empty() => {
                            chunk.replace(secret, MASKED_SECRET)
                        }
                        _ => chunk,
                    };
                    if self.debug_buffer {
                        for line in chunk.lines() {
                            debug!("{} buffer: {}", self.peer_ip(), line);
                        }
                    }
                    self.transcript.push_str(&chunk);
                    data.push_str(&chunk);

                    if let Some(kind) = classify_prompt(last_line(&data), &self.password_prompt) {
                        trace!("{} found prompt ({kind:?})", self.peer_ip());
                        return Ok((CmdStatus::Complete, data));
                    }
                    if started.elapsed() > READ_TIMEOUT {
                        trace!("{} response window elapsed", self.peer_ip());
                        return Ok((CmdStatus::Timeout, data));
                    }
                }
                None => {
                    if data.is_empty() {
                        return Ok((CmdStatus::Timeout, data));
                    }
                    return Ok((CmdStatus::Complete, data));
                }
            }
        }
    }

    /// Raises the session to a privileged prompt if it is not there already.
    ///
    /// Probes with empty commands until a `>` or `#` prompt classifies the
    /// session, then walks the enable-password dialog when needed. Both
    /// loops carry an explicit bound so an unresponsive device cannot stall
    /// the run.
    pub async fn ensure_enabled(
        &mut self,
        enable_cmd: &str,
        enable_password: &str,
    ) -> Result<(), BackupError> {
        if self.enable_state == EnableState::Enabled {
            return Ok(());
        }
        debug!("{} ensuring session is enabled", self.peer_ip());

        let mut state = EnableState::Unknown;
        for attempt in 0..PROMPT_MAX_ROUNDS {
            let (_, resp) = self.do_command("", None).await?;
            trace!(
                "{} attempt {} of {} to find a prompt",
                self.peer_ip(),
                attempt + 1,
                PROMPT_MAX_ROUNDS
            );
            if ENABLED_PROMPT.is_match(last_line(&resp)) {
                state = EnableState::Enabled;
                break;
            }
            if NORMAL_PROMPT.is_match(last_line(&resp)) {
                state = EnableState::Normal;
                break;
            }
        }

        match state {
            EnableState::Enabled => {
                self.enable_state = EnableState::Enabled;
                return Ok(());
            }
            EnableState::Normal if enable_password.is_empty() => {
                // Nothing to escalate with; the dialect may not need it.
                self.enable_state = EnableState::Normal;
                return Ok(());
            }
            EnableState::Normal => {}
            _ => {
                self.enable_state = EnableState::Failed;
                return Err(BackupError::EnableFailed);
            }
        }

        debug!("{} sending enable command", self.peer_ip());
        let (_, mut resp) = self.do_command(enable_cmd, None).await?;
        let password_prompt = self.password_prompt.to_ascii_lowercase();
        for _ in 0..PROMPT_MAX_ROUNDS {
            if ENABLED_PROMPT.is_match(last_line(&resp)) {
                debug!("{} session is now enabled", self.peer_ip());
                self.enable_state = EnableState::Enabled;
                return Ok(());
            }
            if resp.to_ascii_lowercase().contains(&password_prompt) {
                let (_, next) = self
                    .do_command(enable_password, Some(enable_password))
                    .await?;
                resp = next;
                continue;
            }
            if NORMAL_PROMPT.is_match(last_line(&resp)) {
                // Back at the unprivileged prompt: the password was refused.
                break;
            }
            let (_, more) = self.read_more(Some(enable_password)).await?;
            if !more.is_empty() {
                resp = more;
            }
        }

        debug!("{} enable login failed", self.peer_ip());
        self.enable_state = EnableState::Failed;
        Err(BackupError::EnableFailed)
    }

    /// Closes the underlying transport, sending a polite exit first.
    pub async fn close(&mut self) {
        self.transport.disconnect(true).await;
    }
}

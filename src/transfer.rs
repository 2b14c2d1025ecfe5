//! Copy-to-server dialog driver.
//!
//! After the session is enabled, the copy command kicks off an interactive
//! dialog on the device: host prompts, filename prompts, sometimes a
//! confirmation. [`next_action`] is a pure classifier from the latest
//! response to the next step, and [`run_transfer`] loops it against a
//! [`CommandChannel`] with a hard round bound.

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::DIALOG_MAX_ROUNDS;
use crate::device::DeviceType;
use crate::error::BackupError;
use crate::session::{CmdStatus, CommandChannel};

/// Interactive question shape: a word or bracketed default, a question
/// mark, then only non-word characters to end of input.
static INTERACTIVE_PROMPT: Lazy<Regex> = Lazy::new(|| match Regex::new(r"[\w\]\[]\?[^\w]*$") {
    Ok(re) => re,
    Err(e) => panic!("hardcoded prompt pattern must compile: {e}"),
});

/// Next step in the copy dialog, decided from the device's latest output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogAction {
    /// The device is still echoing our own command; keep reading.
    WaitMore,
    /// Answer a host/address question with the transfer server.
    SendServer,
    /// Answer a destination-filename question with the transfer name.
    SendFilename,
    /// Answer a confirmation question affirmatively (once).
    SendConfirm,
    /// Question shape not recognized; accept whatever default it offers.
    SendReturn,
    /// The device reported the copy finished.
    Success,
    /// The device reported an error.
    Failure,
}

/// What the dialog itself claimed about the copy. Advisory only; the file
/// fetch is the arbiter of whether a config actually arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReport {
    Success,
    Errored,
    /// Round bound exhausted without a terminal marker.
    Undetermined,
}

/// Builds the device-side copy command from the dialect template.
pub fn build_copy_command(template: &str, server: &str, filename: &str) -> String {
    template
        .replace("%SERVER%", server)
        .replace("%FILE%", filename)
}

/// Classifies the device's latest output into the next dialog step.
///
/// `sent` is the copy command as issued, for echo detection. `confirmed`
/// records whether an affirmative answer has already been given, so a
/// dialect that re-echoes its confirmation question is not answered twice.
pub fn next_action(
    response: &str,
    sent: &str,
    filename: &str,
    server: &str,
    force_confirm: bool,
    confirmed: bool,
) -> DialogAction {
    let trimmed = response.trim_end();
    if !sent.is_empty() && trimmed.ends_with(sent) {
        return DialogAction::WaitMore;
    }

    let lower = response.to_ascii_lowercase();
    if lower.contains("bytes copied") || lower.contains("successful") {
        return DialogAction::Success;
    }
    if lower.contains("error") {
        return DialogAction::Failure;
    }

    if INTERACTIVE_PROMPT.is_match(trimmed) {
        if (lower.contains("address") || lower.contains("host") || lower.contains("name of"))
            && !response.contains(&format!("[{server}]"))
        {
            return DialogAction::SendServer;
        }
        if lower.contains("filename") {
            // Source-filename questions and a default already naming our
            // file both take the offered default; confirmation never
            // happens at a filename question.
            if lower.contains("source")
                || (response.contains(&format!("[{filename}]")) && !force_confirm)
            {
                return DialogAction::SendReturn;
            }
            return DialogAction::SendFilename;
        }
    }

    // `[confirm]` and `to tftp:` style questions carry word characters
    // after the `?`, so confirmation is keyword-matched, not shape-gated.
    if lower.contains("confirm") || lower.contains("y/n") || lower.contains("to tftp:") {
        return if confirmed {
            DialogAction::SendReturn
        } else {
            DialogAction::SendConfirm
        };
    }

    if force_confirm && !confirmed && INTERACTIVE_PROMPT.is_match(trimmed) {
        return DialogAction::SendConfirm;
    }

    DialogAction::SendReturn
}

/// Drives the copy dialog to completion over an enabled channel.
///
/// Issues the dialect's copy command and then answers each question the
/// device asks, up to [`DIALOG_MAX_ROUNDS`] rounds. The dialog's word is
/// never final: a claimed failure and an exhausted bound are both reported
/// back for the caller to arbitrate against the received file.
pub async fn run_transfer(
    channel: &mut CommandChannel,
    dialect: &DeviceType,
    server: &str,
    filename: &str,
) -> Result<TransferReport, BackupError> {
    let command = build_copy_command(&dialect.copy_cmd, server, filename);
    debug!("{} starting transfer: {}", channel.peer_ip(), command);

    let (_, mut response) = channel.do_command(&command, None).await?;
    let mut sent = command.clone();
    let mut confirmed = false;

    for round in 1..=DIALOG_MAX_ROUNDS {
        let action = next_action(
            &response,
            &sent,
            filename,
            server,
            dialect.force_confirm,
            confirmed,
        );
        trace!(
            "{} transfer round {} of {}: {:?}",
            channel.peer_ip(),
            round,
            DIALOG_MAX_ROUNDS,
            action
        );
        let reply = match action {
            DialogAction::Success => {
                debug!("{} transfer reported success", channel.peer_ip());
                return Ok(TransferReport::Success);
            }
            DialogAction::Failure => {
                debug!("{} transfer reported an error", channel.peer_ip());
                return Ok(TransferReport::Errored);
            }
            DialogAction::WaitMore => {
                let (status, more) = channel.read_more(None).await?;
                if status == CmdStatus::Timeout && more.is_empty() {
                    // Quiet device with only our echo on screen; nudge it.
                    let (_, nudged) = channel.do_command("", None).await?;
                    response = nudged;
                } else {
                    response = more;
                }
                continue;
            }
            DialogAction::SendServer => server,
            DialogAction::SendFilename => filename,
            DialogAction::SendConfirm => {
                confirmed = true;
                "y"
            }
            DialogAction::SendReturn => "",
        };
        let (_, next) = channel.do_command(reply, None).await?;
        sent = reply.to_string();
        response = next;
    }

    debug!(
        "{} transfer dialog gave no verdict in {} rounds",
        channel.peer_ip(),
        DIALOG_MAX_ROUNDS
    );
    Ok(TransferReport::Undetermined)
}

//! Landing-area pickup and config content scanning.
//!
//! The transfer server drops the uploaded config under the backup root with
//! the transfer name. [`fetch_config`] picks it up, validates it, and
//! normalizes line endings; the scanners pull the hostname and the
//! last-change stamp out of the text, with a device-uptime fallback for
//! dialects that do not record change stamps in the config itself.

use std::path::Path;

use chrono::NaiveDateTime;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::CHANGE_SKEW_SECS;
use crate::error::BackupError;
use crate::session::{CmdStatus, CommandChannel};

/// A terminating `end` line, allowing surrounding punctuation/whitespace.
static END_MARKER: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\n[^\w]*end[^\w]*$") {
    Ok(re) => re,
    Err(e) => panic!("hardcoded end pattern must compile: {e}"),
});

/// Facts scraped from the config body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigFacts {
    /// Change stamp and the user who made it, when the config records one.
    pub last_change: Option<(i64, String)>,
    /// Hostname the device claims for itself.
    pub hostname: Option<String>,
}

/// Picks up the uploaded config from the landing area.
///
/// Missing, empty, or unreadable files mean the device never uploaded
/// anything usable. The landing file is removed once it has been picked up
/// so a stale copy cannot satisfy a later run; removal failure is logged,
/// not fatal. When the dialect expects a terminating `end` line, its
/// absence marks the download as truncated.
pub async fn fetch_config(
    backup_root: &Path,
    transfer_name: &str,
    check_end: bool,
) -> Result<String, BackupError> {
    let landing = backup_root.join(transfer_name);
    let meta = tokio::fs::metadata(&landing)
        .await
        .map_err(|_| BackupError::NoConfigRetrieved)?;
    if meta.len() == 0 {
        return Err(BackupError::NoConfigRetrieved);
    }

    // Read bytes and decode lossily; device banners are not always UTF-8.
    let raw = tokio::fs::read(&landing).await;
    if let Err(e) = tokio::fs::remove_file(&landing).await {
        warn!("could not remove landing file {}: {e}", landing.display());
    }
    let raw = match raw {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!("could not read landing file {}: {err}", landing.display());
            return Err(BackupError::NoConfigRetrieved);
        }
    };

    let data = raw.replace("\r\n", "\n");
    if check_end && !END_MARKER.is_match(data.trim_end()) {
        return Err(BackupError::ValidationFailed);
    }
    Ok(data)
}

/// Scans a config body for the hostname and last-change stamp.
pub fn scan_config(data: &str) -> ConfigFacts {
    let mut facts = ConfigFacts::default();
    for line in data.lines() {
        let line = line.trim_end();
        if let Some((_, rest)) = line.split_once("Last configuration change at ") {
            let (stamp, user) = match rest.split_once(" by ") {
                Some((stamp, user)) => (stamp, user.trim().to_string()),
                None => (rest, String::new()),
            };
            if let Some(epoch) = parse_change_stamp(stamp) {
                facts.last_change = Some((epoch, user));
            }
        } else if let Some(name) = line.strip_prefix("hostname ") {
            facts.hostname = Some(name.trim().to_string());
        } else if let Some(name) = line.strip_prefix("set system name ") {
            facts.hostname = Some(name.trim_matches(|c: char| c == '"' || c.is_whitespace()).to_string());
        }
    }
    facts
}

/// Parses an IOS-style change stamp such as
/// `12:01:03 UTC Tue Mar 4 2025` into a unix timestamp.
///
/// The stamp leads with the time and trails with the date, so the tokens
/// are reordered before parsing. The zone token is ignored; stamps are
/// treated as UTC.
pub fn parse_change_stamp(stamp: &str) -> Option<i64> {
    let t: Vec<&str> = stamp.split_whitespace().collect();
    if t.len() < 6 {
        return None;
    }
    let reordered = format!("{} {} {} {}", t[3], t[4], t[5], t[0]);
    NaiveDateTime::parse_from_str(&reordered, "%b %d %Y %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Parses an uptime phrase (`... uptime is 3 weeks, 2 days, 5 hours ...`)
/// into seconds. Units follow router accounting, where a year is 52 weeks
/// and a month is four.
pub fn parse_uptime(text: &str) -> Option<i64> {
    let (_, tail) = text.split_once(" uptime is ")?;
    let tail = tail.lines().next().unwrap_or(tail);
    let mut total: i64 = 0;
    let mut seen = false;
    for part in tail.split(',') {
        let mut words = part.split_whitespace();
        let Some(count) = words.next().and_then(|w| w.parse::<i64>().ok()) else {
            continue;
        };
        let Some(unit) = words.next() else { continue };
        let secs = match unit.trim_end_matches(|c: char| !c.is_alphabetic()) {
            "year" | "years" => 31_449_600,
            "month" | "months" => 2_419_200,
            "week" | "weeks" => 604_800,
            "day" | "days" => 86_400,
            "hour" | "hours" => 3_600,
            "minute" | "minutes" => 60,
            "second" | "seconds" => 1,
            _ => continue,
        };
        total += count * secs;
        seen = true;
    }
    seen.then_some(total)
}

/// Derives a change stamp from device uptime when the config carries none.
///
/// Disables paging, scrapes the dialect's version command for the uptime
/// phrase, and takes boot time (`now - uptime`) as the change stamp. The
/// derived stamp only replaces the recorded one when they disagree by more
/// than the allowed skew, so a rebooted device registers as changed without
/// clock jitter doing the same.
pub async fn change_time_from_uptime(
    channel: &mut CommandChannel,
    version_cmd: &str,
    now: i64,
    recorded: i64,
) -> Result<Option<(i64, String)>, BackupError> {
    for pager_off in ["terminal length 0", "terminal pager 0"] {
        let (status, _) = channel.do_command(pager_off, None).await?;
        if status == CmdStatus::Timeout {
            debug!("{} no response to '{pager_off}'", channel.peer_ip());
        }
    }
    let (_, output) = channel.do_command_full(version_cmd, None).await?;
    let Some(uptime) = parse_uptime(&output) else {
        return Ok(None);
    };
    let booted = now - uptime;
    if (booted - recorded).abs() > CHANGE_SKEW_SECS {
        Ok(Some((booted, "-- Reboot --".to_string())))
    } else {
        Ok(None)
    }
}

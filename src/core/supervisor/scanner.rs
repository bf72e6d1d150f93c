// src/core/supervisor/scanner.rs

//! Pure line scanning for instance stdout.
//!
//! One scanner runs per process and turns interesting lines into typed
//! events: TPS reports (written in response to the periodic `tps` command)
//! and player join/leave announcements.

use once_cell::sync::Lazy;
use regex::Regex;

static TPS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"TPS from last \d+m(?:, \d+m)*: ([\d.,]+)")
        .expect("TPS regex must compile")
});

static JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+) joined the game").expect("join regex must compile"));

static LEAVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+) left the game").expect("leave regex must compile"));

/// A typed observation scanned out of one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Tps(f64),
    PlayerJoined(String),
    PlayerLeft(String),
}

/// Scans one stdout line. Returns `None` for the overwhelming majority of
/// lines that carry nothing of interest.
pub fn scan(line: &str) -> Option<LineEvent> {
    if let Some(caps) = TPS_RE.captures(line) {
        if let Some(tps) = parse_tps_value(caps.get(1)?.as_str()) {
            return Some(LineEvent::Tps(tps));
        }
    }
    if let Some(caps) = JOIN_RE.captures(line) {
        return Some(LineEvent::PlayerJoined(caps.get(1)?.as_str().to_string()));
    }
    if let Some(caps) = LEAVE_RE.captures(line) {
        return Some(LineEvent::PlayerLeft(caps.get(1)?.as_str().to_string()));
    }
    None
}

/// Parses the first TPS figure from the captured group. Servers in some
/// locales print comma decimals ("19,87"), and the capture may drag along
/// the separator before the next figure, so separators are normalized and
/// trailing punctuation stripped before the parse.
fn parse_tps_value(raw: &str) -> Option<f64> {
    let normalized = raw.replace(',', ".");
    let trimmed = normalized.trim_end_matches('.');
    trimmed.parse::<f64>().ok()
}

//! Trainer log header parsing.
//!
//! The trainer prefixes every structured line with
//! `YYYY-MM-DD HH:MM:SS [LEVEL]   message`, optionally wrapped in ANSI color
//! codes. Lines without that header are not errors; they simply carry no
//! structured record.

use chrono::{Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

static ANSI_COLOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;]*m").expect("ANSI color regex should be valid")
});

static HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}\s\d{2}:\d{2}:\d{2})\s\[(\w+)\s*\]\s+(\S.*)$")
        .expect("log header regex should be valid")
});

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Severity of a parsed trainer log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    /// Any other bracketed level, lowercased.
    Unrecognized(String),
}

impl Severity {
    fn from_level(level: &str) -> Self {
        match level {
            "INFO" => Self::Info,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "FAIL" => Self::Critical,
            other => Self::Unrecognized(other.to_lowercase()),
        }
    }

    /// Error and critical lines become the run's terminal exception.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Unrecognized(level) => level,
        }
    }
}

/// One structured trainer log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Seconds since the Unix epoch, interpreted in the local time zone.
    /// `None` when the wall-clock time does not exist locally (DST gap).
    pub timestamp: Option<i64>,
    pub severity: Severity,
    pub message: String,
}

/// Removes ANSI color sequences (`ESC [ ... m`).
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_COLOR_REGEX.replace_all(line, "")
}

/// Parses a raw output line into a [`LogRecord`].
///
/// Returns `None` when the line does not carry the trainer header.
pub fn parse_line(line: &str) -> Option<LogRecord> {
    let line = strip_ansi(line);
    let caps = HEADER_REGEX.captures(line.trim())?;

    let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT)
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp());

    Some(LogRecord {
        timestamp,
        severity: Severity::from_level(&caps[2]),
        message: caps[3].trim_end().to_string(),
    })
}

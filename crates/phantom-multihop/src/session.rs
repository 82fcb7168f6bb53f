//! The live session log written by the monitor.
//!
//! Entries are `[HH:MM:SS] [LEVEL] message`. The file starts with a short
//! banner when a session begins, is emptied when multihop is switched off
//! and rolls over to `<name>.1` once it passes [`MAX_LOG_BYTES`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use phantom_system::fs::{self, FsError, PRIVATE_MODE};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

/// Size at which the log rolls over.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Lines returned by `get_session_log` when no count is given.
pub const DEFAULT_LOG_LINES: usize = 50;

const RULE: &str = "============================================================";

static ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\]\s+(?:\[([A-Z]+)\]\s+)?(.*)$")
        .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Severity of a session log entry, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Diagnostic detail.
    Debug,
    /// Routine status.
    Info,
    /// A recovery worked.
    Success,
    /// Degraded but working.
    Warning,
    /// Broken.
    Error,
}

impl Level {
    const ALL: [Self; 5] = [
        Self::Debug,
        Self::Info,
        Self::Success,
        Self::Warning,
        Self::Error,
    ];

    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Every spelling accepted for this level; `WARN` is short for `WARNING`.
    const fn names(self) -> &'static [&'static str] {
        match self {
            Self::Warning => &["WARNING", "WARN"],
            Self::Debug => &["DEBUG"],
            Self::Info => &["INFO"],
            Self::Success => &["SUCCESS"],
            Self::Error => &["ERROR"],
        }
    }

    /// Level of an entry without an explicit tag: the first level named in
    /// the message, else `INFO`.
    #[must_use]
    pub fn infer(message: &str) -> Self {
        let upper = message.to_uppercase();
        Self::ALL
            .into_iter()
            .find(|level| level.names().iter().any(|name| upper.contains(name)))
            .unwrap_or(Self::Info)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|level| level.names().contains(&upper.as_str()))
            .ok_or_else(|| format!("unknown log level: {s}"))
    }
}

/// One parsed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    /// `HH:MM:SS`.
    pub timestamp: String,
    /// Text after the level tag.
    pub message: String,
    /// Tagged or inferred level.
    pub level: Level,
}

/// Parses a `[HH:MM:SS] ...` line; banner lines yield `None`.
#[must_use]
pub fn parse_entry(line: &str) -> Option<Entry> {
    let caps = ENTRY.captures(line.trim_end())?;
    let message = caps.get(3).map_or("", |m| m.as_str()).to_string();
    let level = caps
        .get(2)
        .and_then(|tag| tag.as_str().parse().ok())
        .unwrap_or_else(|| Level::infer(&message));
    Some(Entry {
        timestamp: caps.get(1).map_or("", |m| m.as_str()).to_string(),
        message,
        level,
    })
}

/// Handle on the session log file.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
    min_level: Level,
}

impl SessionLog {
    /// Log at `path` recording every level.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_level: Level::Debug,
        }
    }

    /// Drops entries below `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn rotated(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    /// Starts a new session, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn start(&self, exit: &str, now: DateTime<Utc>) -> Result<(), FsError> {
        let banner = [
            RULE.to_string(),
            "MULTIHOP HANDSHAKE MONITOR - LIVE SESSION".to_string(),
            RULE.to_string(),
            format!("Session Started: {}", now.format("%Y-%m-%d %H:%M:%S")),
            format!("Exit Server: {exit}"),
            "Monitor: Managed by phantom-multihop-monitor.service".to_string(),
            RULE.to_string(),
            String::new(),
            format!(
                "[{}] SESSION STARTED - Handshake monitoring active",
                now.format("%H:%M:%S")
            ),
        ];
        let mut contents = banner.join("\n");
        contents.push('\n');
        fs::write_atomic(&self.path, contents.as_bytes(), PRIVATE_MODE)?;
        info!(exit, path = %self.path.display(), "session log started");
        Ok(())
    }

    /// Appends an entry if `level` passes the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn append(&self, level: Level, message: &str, now: DateTime<Utc>) -> Result<(), FsError> {
        if level < self.min_level {
            return Ok(());
        }
        self.rotate_if_full();
        let line = format!("[{}] [{level}] {message}", now.format("%H:%M:%S"));
        fs::append_line(&self.path, &line, PRIVATE_MODE)
    }

    fn rotate_if_full(&self) {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return;
        };
        if meta.len() < MAX_LOG_BYTES {
            return;
        }
        match std::fs::rename(&self.path, self.rotated()) {
            Ok(()) => info!(path = %self.path.display(), "session log rotated"),
            Err(err) => warn!(error = %err, "session log rotation failed"),
        }
    }

    /// Empties the log. Returns whether there was anything to empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn truncate(&self) -> Result<bool, FsError> {
        if !self.exists() {
            return Ok(false);
        }
        fs::write_atomic(&self.path, b"", PRIVATE_MODE)?;
        fs::remove_file(&self.rotated())?;
        Ok(true)
    }

    /// Last `lines` entries and the total entry count.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn tail(&self, lines: usize) -> Result<(Vec<Entry>, usize), FsError> {
        let contents = fs::read_optional(&self.path)?.unwrap_or_default();
        let entries: Vec<Entry> = contents.lines().filter_map(parse_entry).collect();
        let total = entries.len();
        let shown = entries.into_iter().skip(total.saturating_sub(lines)).collect();
        Ok((shown, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    #[test_case("[12:00:01] [WARNING] Handshake: 150s [Warning]", Level::Warning, "Handshake: 150s [Warning]")]
    #[test_case("[12:00:01] [WARN] Handshake: 150s", Level::Warning, "Handshake: 150s")]
    #[test_case("[12:00:01] warn: handshake is getting old", Level::Warning, "warn: handshake is getting old")]
    #[test_case("[12:00:01] SESSION STARTED - Handshake monitoring active", Level::Info, "SESSION STARTED - Handshake monitoring active")]
    #[test_case("[12:00:01] reconnect error on attempt 2", Level::Error, "reconnect error on attempt 2")]
    #[test_case("[12:00:01] debug: success after warning", Level::Debug, "debug: success after warning")]
    fn entries_parse(line: &str, level: Level, message: &str) {
        let entry = parse_entry(line).expect("entry");
        assert_eq!(entry.timestamp, "12:00:01");
        assert_eq!(entry.level, level);
        assert_eq!(entry.message, message);
    }

    #[test]
    fn banner_lines_are_skipped() {
        assert!(parse_entry("MULTIHOP HANDSHAKE MONITOR - LIVE SESSION").is_none());
        assert!(parse_entry(RULE).is_none());
    }

    #[test]
    fn session_roundtrip_with_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SessionLog::new(dir.path().join("session.log")).with_min_level(Level::Info);
        log.start("stockholm", at(1_700_000_000)).expect("start");
        log.append(Level::Debug, "checking", at(1_700_000_030)).expect("debug");
        log.append(Level::Info, "Handshake: 12s [Good]", at(1_700_000_030))
            .expect("info");
        log.append(Level::Error, "Handshake: No connection", at(1_700_000_060))
            .expect("error");

        let raw = std::fs::read_to_string(log.path()).expect("read");
        assert!(raw.contains("Exit Server: stockholm"));
        assert!(raw.contains("Session Started: 2023-11-14 22:13:20"));
        assert!(!raw.contains("checking"));

        let (entries, total) = log.tail(2).expect("tail");
        assert_eq!(total, 3);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Handshake: 12s [Good]");
        assert_eq!(entries[1].level, Level::Error);
        assert_eq!(entries[1].timestamp, "22:14:20");

        assert!(log.truncate().expect("truncate"));
        assert_eq!(log.tail(50).expect("tail").1, 0);
    }

    #[test]
    fn full_log_rolls_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.log");
        let big = std::fs::File::create(&path).expect("create");
        big.set_len(MAX_LOG_BYTES).expect("grow");
        drop(big);

        let log = SessionLog::new(&path);
        log.append(Level::Info, "fresh", at(0)).expect("append");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "[00:00:00] [INFO] fresh\n"
        );
        assert!(dir.path().join("session.log.1").exists());
    }

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("warning".parse::<Level>(), Ok(Level::Warning));
        assert_eq!("warn".parse::<Level>(), Ok(Level::Warning));
        assert!("loud".parse::<Level>().is_err());
        assert!(Level::Debug < Level::Error);
    }
}

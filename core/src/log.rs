//! Log retrieval options and logging driver classification.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Lines kept by the bounded tail used for termination messages.
pub const MAX_TAIL_LOG_LINES: i64 = 80;

/// Bytes kept by the bounded tail used for termination messages.
pub const MAX_TAIL_LOG_BYTES: usize = 2 * 1024;

/// Logging drivers whose output the engine can replay through its logs API.
pub const CRI_SUPPORTED_LOG_DRIVERS: &[&str] = &["json-file"];

/// Engine logging driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    JsonFile,
    Local,
    Journald,
    None,
    Other(String),
}

impl LogDriver {
    /// Whether logs written by this driver can be pulled back for the node agent.
    pub fn supports_cri_retrieval(&self) -> bool {
        CRI_SUPPORTED_LOG_DRIVERS.contains(&self.to_string().as_str())
    }
}

impl std::fmt::Display for LogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonFile => write!(f, "json-file"),
            Self::Local => write!(f, "local"),
            Self::Journald => write!(f, "journald"),
            Self::None => write!(f, "none"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for LogDriver {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "json-file" => Self::JsonFile,
            "local" => Self::Local,
            "journald" => Self::Journald,
            "none" => Self::None,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Options for a container log retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Relative cutoff: only entries newer than now minus this many seconds.
    pub since_seconds: Option<i64>,
    /// Absolute cutoff. Takes precedence over `since_seconds`.
    pub since_time: Option<DateTime<Utc>>,
    /// Only the last N lines.
    pub tail_lines: Option<i64>,
    /// Shared byte budget across stdout and stderr.
    pub limit_bytes: Option<i64>,
    /// Prefix each line with the engine timestamp.
    pub timestamps: bool,
    /// Keep streaming until the process exits or the caller stops.
    pub follow: bool,
}

impl LogOptions {
    /// Cutoff as Unix seconds (0 = no cutoff).
    ///
    /// The absolute `since_time` overrides the relative `since_seconds`
    /// whenever both are present.
    pub fn since_cutoff(&self, now: DateTime<Utc>) -> i64 {
        self.since_instant(now).map(|t| t.timestamp()).unwrap_or(0)
    }

    /// Exact cutoff instant, same precedence as [`Self::since_cutoff`].
    pub fn since_instant(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.since_time, self.since_seconds) {
            (Some(time), _) => Some(time),
            (None, Some(secs)) => Some(now - ChronoDuration::seconds(secs)),
            (None, None) => None,
        }
    }

    /// Tail argument understood by the engine.
    pub fn tail(&self) -> String {
        match self.tail_lines {
            Some(n) if n >= 0 => n.to_string(),
            _ => "all".to_string(),
        }
    }

    /// Byte budget, if any. Negative limits are treated as zero.
    pub fn byte_limit(&self) -> Option<u64> {
        self.limit_bytes.map(|n| n.max(0) as u64)
    }
}

/// A single chunk of container output. Transient; never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub stream: LogStream,
    /// Engine timestamp, present when timestamps were requested.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Build an entry, reading the leading RFC 3339 timestamp when present.
    pub fn new(stream: LogStream, payload: Vec<u8>, timestamps: bool) -> Self {
        let timestamp = if timestamps {
            parse_leading_timestamp(&payload)
        } else {
            None
        };
        Self {
            stream,
            timestamp,
            payload,
        }
    }

    /// Whether the entry is known to predate `cutoff`. Entries without a
    /// timestamp never are.
    pub fn is_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.timestamp.is_some_and(|t| t < cutoff)
    }
}

fn parse_leading_timestamp(payload: &[u8]) -> Option<DateTime<Utc>> {
    let end = payload.iter().position(|b| *b == b' ')?;
    let raw = std::str::from_utf8(&payload[..end]).ok()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_driver_from_str() {
        assert_eq!("json-file".parse::<LogDriver>().unwrap(), LogDriver::JsonFile);
        assert_eq!("journald".parse::<LogDriver>().unwrap(), LogDriver::Journald);
        assert_eq!(
            "fluentd".parse::<LogDriver>().unwrap(),
            LogDriver::Other("fluentd".to_string())
        );
    }

    #[test]
    fn test_only_json_file_supports_retrieval() {
        assert!(LogDriver::JsonFile.supports_cri_retrieval());
        assert!(!LogDriver::Journald.supports_cri_retrieval());
        assert!(!LogDriver::Local.supports_cri_retrieval());
        assert!(!LogDriver::Other("syslog".to_string()).supports_cri_retrieval());
    }

    #[test]
    fn test_since_cutoff_none() {
        let opts = LogOptions::default();
        assert_eq!(opts.since_cutoff(Utc::now()), 0);
    }

    #[test]
    fn test_since_seconds_relative() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let opts = LogOptions {
            since_seconds: Some(60),
            ..Default::default()
        };
        assert_eq!(
            opts.since_cutoff(now),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn test_absolute_since_wins() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let absolute = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        // Absolute older than relative.
        let opts = LogOptions {
            since_seconds: Some(10),
            since_time: Some(absolute),
            ..Default::default()
        };
        assert_eq!(opts.since_cutoff(now), absolute.timestamp());

        // Absolute newer than relative.
        let recent = Utc.with_ymd_and_hms(2026, 1, 1, 11, 59, 59).unwrap();
        let opts = LogOptions {
            since_seconds: Some(86_400),
            since_time: Some(recent),
            ..Default::default()
        };
        assert_eq!(opts.since_cutoff(now), recent.timestamp());
    }

    #[test]
    fn test_tail() {
        assert_eq!(LogOptions::default().tail(), "all");
        let opts = LogOptions {
            tail_lines: Some(5),
            ..Default::default()
        };
        assert_eq!(opts.tail(), "5");
        let opts = LogOptions {
            tail_lines: Some(-1),
            ..Default::default()
        };
        assert_eq!(opts.tail(), "all");
    }

    #[test]
    fn test_byte_limit_negative() {
        let opts = LogOptions {
            limit_bytes: Some(-4),
            ..Default::default()
        };
        assert_eq!(opts.byte_limit(), Some(0));
    }

    #[test]
    fn test_log_entry_timestamp() {
        let entry = LogEntry::new(
            LogStream::Stdout,
            b"2026-02-12T06:00:00.250000000Z hello\n".to_vec(),
            true,
        );
        let at = Utc.with_ymd_and_hms(2026, 2, 12, 6, 0, 0).unwrap();
        assert_eq!(entry.timestamp, Some(at + ChronoDuration::milliseconds(250)));
        assert!(entry.is_before(at + ChronoDuration::milliseconds(500)));
        assert!(!entry.is_before(at));

        let entry = LogEntry::new(LogStream::Stderr, b"hello\n".to_vec(), false);
        assert!(entry.timestamp.is_none());
        assert!(!entry.is_before(at));
    }
}

//! JSON-line logging for the trigger builder. Records carry the pulse
//! id, link, and batch they concern; the `-v` flag count maps onto the
//! level filter.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Maps repeated `-v` flags to a level filter.
    pub fn from_verbose(verbose: u32) -> Self {
        match verbose {
            0 => LogLevel::Info,
            1 | 2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Domain context attached to a record. Absent fields stay off the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    pulse_id: Option<u64>,
    link: Option<u32>,
    batch: Option<usize>,
}

impl LogContext {
    /// Tags the record with the pulse id under report.
    pub fn pulse(mut self, pid: u64) -> Self {
        self.pulse_id = Some(pid);
        self
    }

    /// Tags the record with a peer link id.
    pub fn link(mut self, id: u32) -> Self {
        self.link = Some(id);
        self
    }

    /// Tags the record with a batch index.
    pub fn batch(mut self, index: usize) -> Self {
        self.batch = Some(index);
        self
    }
}

/// Seal the active segment once it reaches `segment_bytes`; keep at most
/// `keep_segments` sealed segments behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub segment_bytes: usize,
    pub keep_segments: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            segment_bytes: 256 << 20,
            keep_segments: 8,
        }
    }
}

/// One run of log lines, sealed or still accumulating.
#[derive(Debug, Default, Clone)]
pub struct LogSegment {
    lines: Vec<String>,
    bytes: usize,
}

impl LogSegment {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn push(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len());
        self.lines.push(line);
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    module: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pulse_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<usize>,
    message: &'a str,
}

/// JSON-line logger with level filtering and segment rotation.
#[derive(Debug)]
pub struct JsonLineLogger {
    policy: RotationPolicy,
    level: LogLevel,
    sealed: VecDeque<LogSegment>,
    active: LogSegment,
}

impl JsonLineLogger {
    pub fn new(policy: RotationPolicy) -> Self {
        Self {
            policy,
            level: LogLevel::Info,
            sealed: VecDeque::new(),
            active: LogSegment::default(),
        }
    }

    pub fn with_verbose(verbose: u32) -> Self {
        let mut logger = Self::new(RotationPolicy::default());
        logger.set_level(LogLevel::from_verbose(verbose));
        logger
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    pub fn log(
        &mut self,
        level: LogLevel,
        module: &str,
        ctx: LogContext,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.level {
            return Ok(());
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let record = LogRecord {
            ts,
            level: level.as_str(),
            module,
            pulse_id: ctx.pulse_id.map(|pid| format!("{pid:014x}")),
            link: ctx.link,
            batch: ctx.batch,
            message,
        };
        let line = serde_json::to_string(&record)?;
        if !self.active.lines.is_empty()
            && self.active.bytes + line.len() > self.policy.segment_bytes
        {
            self.seal();
        }
        self.active.push(line);
        Ok(())
    }

    /// Sealed history followed by the active segment.
    pub fn segments(&self) -> impl Iterator<Item = &LogSegment> {
        self.sealed.iter().chain(std::iter::once(&self.active))
    }

    fn seal(&mut self) {
        self.sealed.push_back(std::mem::take(&mut self.active));
        while self.sealed.len() > self.policy.keep_segments {
            self.sealed.pop_front();
        }
    }
}

//! Bounded in-memory log of reported failures.
//!
//! Every top-level handler funnels its errors here so the error
//! pseudo-file can show recent failures with level, time, message, and a
//! stack snapshot. Old records are dropped once the cap is reached.

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

/// How many stack frames a record keeps.
const MAX_STACK_FRAMES: usize = 16;

/// Severity of a reported record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportLevel {
    /// Notable but harmless.
    Info,
    /// Degraded behavior.
    Warning,
    /// A failed operation.
    Error,
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportLevel::Info => f.write_str("INFO"),
            ReportLevel::Warning => f.write_str("WARN"),
            ReportLevel::Error => f.write_str("ERROR"),
        }
    }
}

/// One reported failure.
#[derive(Clone, Debug)]
pub struct ReportedError {
    /// Severity.
    pub level: ReportLevel,
    /// When the report was made.
    pub time: SystemTime,
    /// The error rendered as text.
    pub message: String,
    /// Captured stack frames, outermost last.
    pub stack: Vec<String>,
}

/// Collects reported errors for the error pseudo-file.
#[derive(Debug)]
pub struct Reporter {
    max_errors: usize,
    errors: Mutex<VecDeque<ReportedError>>,
}

impl Reporter {
    /// A reporter keeping at most `max_errors` records.
    pub fn new(max_errors: usize) -> Reporter {
        Reporter {
            max_errors,
            errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an error-level failure.
    pub fn report_err(&self, message: impl Into<String>) {
        self.report(ReportLevel::Error, message);
    }

    /// Record a failure at the given level.
    pub fn report(&self, level: ReportLevel, message: impl Into<String>) {
        let record = ReportedError {
            level,
            time: SystemTime::now(),
            message: message.into(),
            stack: capture_stack(),
        };
        let mut errors = self.errors.lock();
        while errors.len() >= self.max_errors {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    /// Snapshot of the recorded errors, oldest first.
    pub fn errors(&self) -> Vec<ReportedError> {
        self.errors.lock().iter().cloned().collect()
    }

    /// When the most recent record was made.
    pub fn last_error_time(&self) -> Option<SystemTime> {
        self.errors.lock().back().map(|e| e.time)
    }

    /// The stable textual encoding served by the error pseudo-file: one
    /// record per error, newline-terminated, frames indented by a tab.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for err in self.errors.lock().iter() {
            out.push_str(&format!(
                "{} {} {}\n",
                err.level,
                encode_time(err.time),
                err.message
            ));
            for frame in &err.stack {
                out.push('\t');
                out.push_str(frame);
                out.push('\n');
            }
        }
        out
    }
}

/// Seconds.nanoseconds since the epoch; stable across platforms.
pub(crate) fn encode_time(time: SystemTime) -> String {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:09}", since.as_secs(), since.subsec_nanos())
}

fn capture_stack() -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .take(MAX_STACK_FRAMES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_format() {
        let reporter = Reporter::new(8);
        reporter.report_err("lookup: boom");
        let text = reporter.render();
        let mut lines = text.lines();
        let head = lines.next().unwrap();
        assert!(head.starts_with("ERROR "), "{head:?}");
        assert!(head.ends_with(" lookup: boom"), "{head:?}");
        // The timestamp field is seconds.nanoseconds.
        let time = head.split_whitespace().nth(1).unwrap();
        let (secs, nanos) = time.split_once('.').unwrap();
        assert!(secs.parse::<u64>().is_ok());
        assert_eq!(nanos.len(), 9);
        assert!(lines.all(|l| l.starts_with('\t')));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn cap_drops_oldest() {
        let reporter = Reporter::new(2);
        reporter.report_err("one");
        reporter.report_err("two");
        reporter.report_err("three");
        let errors = reporter.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "two");
        assert_eq!(errors[1].message, "three");
    }

    #[test]
    fn last_error_time_tracks_latest() {
        let reporter = Reporter::new(4);
        assert!(reporter.last_error_time().is_none());
        reporter.report_err("one");
        let first = reporter.last_error_time().unwrap();
        reporter.report_err("two");
        assert!(reporter.last_error_time().unwrap() >= first);
    }
}

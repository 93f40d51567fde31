//! JSONL records for torture runs and other harness workflows.
//!
//! One [`LogEntry`] per line. [`LogEmitter`] numbers entries within a run and
//! [`validate_log_line`] checks a line read back from disk.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}

/// One heap call as seen by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapOp {
    /// `malloc`, `calloc`, `memalign`, `realloc` or `free`.
    pub name: String,
    pub size: usize,
    /// User pointer as `0x..`; absent when the call returned none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix time in milliseconds.
    pub ts_ms: u64,
    /// `{run_id}::{seq:06}`.
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<HeapOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Entry without a trace id; the emitter assigns one.
    #[must_use]
    pub fn event(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            ts_ms: unix_millis(),
            trace_id: String::new(),
            level,
            event: event.into(),
            run_id: None,
            op: None,
            outcome: None,
            duration_ms: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_op(mut self, name: &str, size: usize) -> Self {
        self.op = Some(HeapOp {
            name: name.to_string(),
            size,
            pointer: None,
        });
        self
    }

    /// Attaches `addr` to the op set by [`with_op`](Self::with_op).
    #[must_use]
    pub fn with_pointer(mut self, addr: usize) -> Self {
        if let Some(op) = &mut self.op {
            op.pointer = Some(format!("{addr:#x}"));
        }
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// User pointer of the attached op, if any.
    #[must_use]
    pub fn pointer(&self) -> Option<&str> {
        self.op.as_ref()?.pointer.as_deref()
    }
}

/// Writes entries as JSON lines, stamping each with the run id and the next
/// sequence number.
pub struct LogEmitter<W: Write> {
    writer: W,
    run_id: String,
    seq: u64,
}

impl LogEmitter<std::io::BufWriter<std::fs::File>> {
    pub fn to_file(path: &std::path::Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(std::io::BufWriter::new(file), run_id))
    }
}

impl<W: Write> LogEmitter<W> {
    #[must_use]
    pub fn new(writer: W, run_id: &str) -> Self {
        Self {
            writer,
            run_id: run_id.to_string(),
            seq: 0,
        }
    }

    /// Emits a bare event.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<()> {
        self.emit_entry(LogEntry::event(level, event))
    }

    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        self.seq += 1;
        if entry.trace_id.is_empty() {
            entry.trace_id = format!("{}::{:06}", self.run_id, self.seq);
        }
        entry.run_id.get_or_insert_with(|| self.run_id.clone());
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Entries written so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Debug, Error)]
pub enum Problem {
    #[error("not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a JSON object")]
    NotObject,
    #[error("missing required field '{0}'")]
    Missing(&'static str),
    #[error("op pointer '{0}' is not a hex address")]
    BadPointer(String),
}

#[derive(Debug, Error)]
#[error("line {line}: {problems:?}")]
pub struct LogLineError {
    pub line: usize,
    pub problems: Vec<Problem>,
}

const REQUIRED: [&str; 4] = ["ts_ms", "trace_id", "level", "event"];

/// Parses one JSONL line, reporting every problem found on it.
pub fn validate_log_line(text: &str, line: usize) -> Result<LogEntry, LogLineError> {
    let fail = |problems| LogLineError { line, problems };
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| fail(vec![Problem::Json(e)]))?;
    let Some(obj) = value.as_object() else {
        return Err(fail(vec![Problem::NotObject]));
    };

    let mut problems: Vec<Problem> = REQUIRED
        .into_iter()
        .filter(|field| !obj.contains_key(*field))
        .map(Problem::Missing)
        .collect();
    let pointer = obj
        .get("op")
        .and_then(|op| op.get("pointer"))
        .and_then(|p| p.as_str());
    if let Some(pointer) = pointer
        && !pointer.starts_with("0x")
    {
        problems.push(Problem::BadPointer(pointer.to_string()));
    }
    if !problems.is_empty() {
        return Err(fail(problems));
    }

    serde_json::from_value(value).map_err(|e| fail(vec![Problem::Json(e)]))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let line = serde_json::to_string(&LogEntry::event(LogLevel::Info, "start")).unwrap();
        assert!(line.contains("\"event\":\"start\""));
        assert!(!line.contains("\"op\""));
        assert!(!line.contains("outcome"));
    }

    #[test]
    fn emitter_numbers_entries_and_tags_run() {
        let mut emitter = LogEmitter::new(Vec::new(), "run7");
        emitter.emit(LogLevel::Info, "begin").unwrap();
        emitter
            .emit_entry(
                LogEntry::event(LogLevel::Debug, "heap_op")
                    .with_op("malloc", 64)
                    .with_pointer(0x1000),
            )
            .unwrap();
        assert_eq!(emitter.emitted(), 2);
        let text = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second = validate_log_line(lines[1], 2).unwrap();
        assert_eq!(second.trace_id, "run7::000002");
        assert_eq!(second.run_id.as_deref(), Some("run7"));
        assert_eq!(second.pointer(), Some("0x1000"));
        assert_eq!(second.op.unwrap().size, 64);
    }

    #[test]
    fn pointer_without_op_is_dropped() {
        let entry = LogEntry::event(LogLevel::Info, "x").with_pointer(0x10);
        assert_eq!(entry.pointer(), None);
    }

    #[test]
    fn validation_reports_every_problem() {
        let err = validate_log_line(
            r#"{"trace_id":"x","level":"info","op":{"name":"free","size":0,"pointer":"12"}}"#,
            4,
        )
        .unwrap_err();
        assert_eq!(err.line, 4);
        assert!(matches!(
            err.problems.as_slice(),
            [Problem::Missing("ts_ms"), Problem::Missing("event"), Problem::BadPointer(p)] if p == "12"
        ));
        assert!(validate_log_line("not json", 1).is_err());
        assert!(matches!(
            validate_log_line("[1]", 1).unwrap_err().problems.as_slice(),
            [Problem::NotObject]
        ));
    }

    #[test]
    fn unknown_level_fails_schema() {
        let err = validate_log_line(
            r#"{"ts_ms":1,"trace_id":"x","level":"loud","event":"e"}"#,
            9,
        )
        .unwrap_err();
        assert!(matches!(err.problems.as_slice(), [Problem::Json(_)]));
    }
}

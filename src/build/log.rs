//! Per-build log
//!
//! Each build writes newline-delimited JSON records to its own file. With
//! the console sink, records are also emitted as tracing events and reach
//! every process layer (console, rotated file, recent lines) tagged with
//! `from_docker`. Nothing from the process log lands in the build file.

use crate::error::{PreviewError, PreviewResult};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Where a build logger writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// Append NDJSON records to a file
    File(PathBuf),
    /// Emit as tracing events to the process subscriber
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// Structured logger bound to one build
pub struct BuildLogger {
    commit_hash: String,
    image_name: String,
    file: Option<Mutex<File>>,
    console: bool,
}

impl BuildLogger {
    /// Open a logger writing to the given sinks
    pub fn open(
        commit_hash: impl Into<String>,
        image_name: impl Into<String>,
        sinks: &[LogSink],
    ) -> PreviewResult<Self> {
        let mut file = None;
        let mut console = false;

        for sink in sinks {
            match sink {
                LogSink::File(path) => {
                    let handle = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| {
                            PreviewError::io(format!("opening build log {}", path.display()), e)
                        })?;
                    file = Some(Mutex::new(handle));
                }
                LogSink::Console => console = true,
            }
        }

        Ok(Self {
            commit_hash: commit_hash.into(),
            image_name: image_name.into(),
            file,
            console,
        })
    }

    pub fn info(&self, msg: &str) {
        self.write(Level::Info, msg, Map::new());
    }

    pub fn error(&self, msg: &str, err: &dyn std::fmt::Display) {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(err.to_string()));
        self.write(Level::Error, msg, fields);
    }

    /// Record a line of container runtime output
    pub fn runtime_output(&self, line: &str) {
        let mut fields = Map::new();
        fields.insert("from_docker".to_string(), Value::Bool(true));
        self.write(Level::Info, line.trim_end(), fields);
    }

    fn write(&self, level: Level, msg: &str, fields: Map<String, Value>) {
        let from_docker = fields.contains_key("from_docker");

        if self.console {
            match level {
                Level::Info => info!(
                    commit_hash = %self.commit_hash,
                    image_name = %self.image_name,
                    from_docker,
                    "{}",
                    msg
                ),
                Level::Error => error!(
                    commit_hash = %self.commit_hash,
                    image_name = %self.image_name,
                    error = fields.get("error").and_then(serde_json::Value::as_str).unwrap_or_default(),
                    "{}",
                    msg
                ),
            }
        }

        let Some(file) = &self.file else {
            return;
        };

        let mut record = json!({
            "time": Utc::now().to_rfc3339(),
            "level": level.as_str(),
            "msg": msg,
            "commit_hash": self.commit_hash,
            "image_name": self.image_name,
        });
        if let Value::Object(map) = &mut record {
            map.extend(fields);
        }

        let mut line = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize build log record: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(commit_hash = %self.commit_hash, "Failed to write build log: {}", e);
        }
    }
}

/// Render NDJSON build log records as plain text, keeping the last `tail` lines
pub fn format_log(content: &str, tail: Option<usize>) -> String {
    let lines: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(record) => {
                let time = record.get("time").and_then(Value::as_str).unwrap_or("");
                let level = record.get("level").and_then(Value::as_str).unwrap_or("info");
                let msg = record.get("msg").and_then(Value::as_str).unwrap_or("");
                match record.get("error").and_then(Value::as_str) {
                    Some(err) => format!("{} {:>5} {} ({})", time, level, msg, err),
                    None => format!("{} {:>5} {}", time, level, msg),
                }
            }
            Err(_) => line.to_string(),
        })
        .collect();

    let start = tail.map_or(0, |n| lines.len().saturating_sub(n));
    lines[start..].join("\n")
}

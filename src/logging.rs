//! Process logging
//!
//! The server logs to the console, to an hourly-rotated JSON file and to an
//! in-memory ring buffer shown by the debug view. One-shot commands only
//! log to the console.

use crate::config::schema::LoggingConfig;
use crate::error::{PreviewError, PreviewResult};
use crate::state::lock;
use chrono::{SecondsFormat, Utc};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the file writer flushing until dropped
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Console filter: 0 = info, 1 = debug, 2+ = trace; `RUST_LOG` wins
fn console_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "previewd=info",
            1 => "previewd=debug",
            _ => "previewd=trace",
        })
    })
}

/// Console-only logging for one-shot commands
pub fn init_cli(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::new("previewd=warn"),
        1 => EnvFilter::new("previewd=info"),
        _ => EnvFilter::new("previewd=debug"),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}

/// Full logging for the server
pub fn init_server(verbose: u8, config: &LoggingConfig) -> PreviewResult<(LoggingGuard, RecentLogs)> {
    std::fs::create_dir_all(&config.dir).map_err(|e| {
        PreviewError::io(format!("creating log directory {}", config.dir.display()), e)
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(env!("CARGO_PKG_NAME"))
        .filename_suffix("log")
        .max_log_files(config.max_files.max(1))
        .build(&config.dir)
        .map_err(|e| PreviewError::Internal(format!("log file setup failed: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let recent = RecentLogs::new(config.ring_buffer);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(console_filter(verbose)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::INFO),
        )
        .with(recent.clone().with_filter(LevelFilter::INFO))
        .try_init()
        .map_err(|e| PreviewError::Internal(format!("logging already initialized: {}", e)))?;

    Ok((LoggingGuard { _file: Some(guard) }, recent))
}

/// Log panics through tracing instead of only to stderr
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(location = %location, "panic: {}", info);
        default_hook(info);
    }));
}

/// Ring buffer of recent formatted log lines
#[derive(Clone)]
pub struct RecentLogs {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl RecentLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        let lines = lock(&self.lines);
        lines.iter().cloned().collect()
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = lock(&self.lines);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn format(level: &Level, visitor: LineVisitor) -> String {
        format!(
            "{} {:>5} {}{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            visitor.message,
            visitor.fields
        )
    }
}

impl<S: Subscriber> Layer<S> for RecentLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.push(Self::format(event.metadata().level(), visitor));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

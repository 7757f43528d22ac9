//! Alert sinks: structured log lines and JSON-lines files.

use crate::domain::alert::{Alert, Severity};
use crate::domain::error::CycleError;
use crate::ports::alert_port::AlertPort;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Emits each alert as a tracing event; CRITICAL and WATCH at warn level.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertPort for LogAlertSink {
    fn deliver(&self, alert: &Alert) -> Result<(), CycleError> {
        match alert.severity {
            Severity::Critical | Severity::Watch => warn!(
                severity = %alert.severity,
                key = %alert.key,
                bar = alert.bar_index,
                timestamp = %alert.timestamp,
                "{}",
                alert.message
            ),
            Severity::Info => info!(
                severity = %alert.severity,
                key = %alert.key,
                bar = alert.bar_index,
                timestamp = %alert.timestamp,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Writes one JSON object per alert to any writer.
pub struct JsonlAlertSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlAlertSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

impl JsonlAlertSink<File> {
    /// Append to `path`, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self, CycleError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> AlertPort for JsonlAlertSink<W> {
    fn deliver(&self, alert: &Alert) -> Result<(), CycleError> {
        let line = serde_json::to_string(alert).map_err(|e| CycleError::Feed {
            reason: format!("encode alert: {}", e),
        })?;
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

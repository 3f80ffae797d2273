//! Audit trail of every dispatched command.
//!
//! Records are JSON lines in a daily-rotated file. Secret values known to the
//! broker registry are scrubbed before anything is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{error, info};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tradebridge_core::{BrokerError, ErrorCode, TradeResult};

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: u64,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    /// `success`, `broker_rejected`, `error`, or `retry` for a failed attempt.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub detail: String,
}

enum Sink {
    File(NonBlocking),
    Memory(Mutex<Vec<AuditRecord>>),
    Disabled,
}

pub struct AuditLogger {
    sink: Sink,
    secrets: RwLock<Vec<String>>,
    _guard: Option<WorkerGuard>,
}

impl AuditLogger {
    /// Append to `dir/audit.YYYY-MM-DD.log`, rotating at midnight UTC.
    pub fn daily(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("audit")
            .filename_suffix("log")
            .build(dir)?;
        // Block the caller rather than drop records when the writer falls behind.
        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(appender);
        info!(dir = %dir.display(), "Audit log enabled");
        Ok(Self {
            sink: Sink::File(writer),
            secrets: RwLock::new(Vec::new()),
            _guard: Some(guard),
        })
    }

    /// Keep records in memory.
    pub fn memory() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
            secrets: RwLock::new(Vec::new()),
            _guard: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: Sink::Disabled,
            secrets: RwLock::new(Vec::new()),
            _guard: None,
        }
    }

    /// Register secret values to scrub. Previously registered values are kept,
    /// so credentials rotated out by a reload stay redacted.
    pub fn add_secrets(&self, secrets: impl IntoIterator<Item = String>) {
        let mut known = match self.secrets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for secret in secrets {
            if !secret.is_empty() && !known.contains(&secret) {
                known.push(secret);
            }
        }
        // Longest first so a secret containing another is fully masked.
        known.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    pub fn redact(&self, text: &str) -> String {
        let known = match self.secrets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        known
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
    }

    pub fn record(&self, mut record: AuditRecord) {
        record.detail = self.redact(&record.detail);

        info!(
            target: "audit",
            session_id = record.session_id,
            action = %record.action,
            broker = record.broker.as_deref().unwrap_or("-"),
            outcome = %record.outcome,
            attempt = record.attempt,
            detail = %record.detail,
            "audit"
        );

        match &self.sink {
            Sink::File(writer) => {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize audit record");
                        return;
                    }
                };
                line.push(b'\n');
                let mut writer = writer.clone();
                if let Err(e) = writer.write_all(&line) {
                    error!(error = %e, "Failed to write audit record");
                }
            }
            Sink::Memory(records) => match records.lock() {
                Ok(mut guard) => guard.push(record),
                Err(poisoned) => poisoned.into_inner().push(record),
            },
            Sink::Disabled => {}
        }
    }

    /// Final outcome of a command.
    pub fn command(
        &self,
        session_id: u64,
        action: &str,
        broker: Option<&str>,
        result: &TradeResult,
        attempts: Option<u32>,
        detail: impl Into<String>,
    ) {
        self.record(AuditRecord {
            timestamp: Utc::now(),
            session_id,
            action: action.to_string(),
            broker: broker.map(str::to_string),
            outcome: result.outcome.as_str().to_string(),
            error_code: result.error_code,
            attempt: attempts,
            detail: detail.into(),
        });
    }

    /// A failed attempt that is about to be retried.
    pub fn retry(&self, session_id: u64, action: &str, broker: &str, attempt: u32, error: &BrokerError) {
        self.record(AuditRecord {
            timestamp: Utc::now(),
            session_id,
            action: action.to_string(),
            broker: Some(broker.to_string()),
            outcome: "retry".to_string(),
            error_code: Some(ErrorCode::NetworkError),
            attempt: Some(attempt),
            detail: error.to_string(),
        });
    }

    /// Records held by a memory sink. Empty for other sinks.
    pub fn records(&self) -> Vec<AuditRecord> {
        match &self.sink {
            Sink::Memory(records) => match records.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradebridge_core::BridgeError;

    #[test]
    fn test_secrets_are_redacted() {
        let audit = AuditLogger::memory();
        audit.add_secrets(["api-key-123".to_string(), "api-key-123456".to_string()]);
        audit.command(
            1,
            "trade",
            Some("EXNESS"),
            &TradeResult::failure(&BridgeError::Network("refused".into())),
            Some(3),
            "auth header api-key-123456 and api-key-123 leaked",
        );

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].detail, "auth header *** and *** leaked");
        assert_eq!(records[0].outcome, "error");
        assert_eq!(records[0].error_code, Some(ErrorCode::NetworkError));
    }

    #[test]
    fn test_retry_records_attempt() {
        let audit = AuditLogger::memory();
        audit.retry(7, "trade", "EXNESS", 2, &BrokerError::Network("503".into()));
        let record = &audit.records()[0];
        assert_eq!(record.session_id, 7);
        assert_eq!(record.outcome, "retry");
        assert_eq!(record.attempt, Some(2));
    }

    #[test]
    fn test_daily_file_sink_writes_json_lines() {
        let dir = std::env::temp_dir().join(format!("tradebridge-audit-{}", std::process::id()));
        {
            let audit = AuditLogger::daily(&dir).unwrap();
            audit.add_secrets(["topsecret".to_string()]);
            audit.command(
                3,
                "ping",
                Some("EXNESS"),
                &TradeResult::success("-", "pong"),
                None,
                "key=topsecret",
            );
            // Dropping the logger flushes the worker.
        }

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_string_lossy().to_string();
        assert!(name.starts_with("audit.") && name.ends_with(".log"));

        let text = std::fs::read_to_string(files[0].path()).unwrap();
        let record: AuditRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(record.session_id, 3);
        assert_eq!(record.detail, "key=***");
        assert!(!text.contains("topsecret"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_daily_file_sink_keeps_every_record_in_a_burst() {
        let dir = std::env::temp_dir().join(format!("tradebridge-audit-burst-{}", std::process::id()));
        const BURST: usize = 5_000;
        {
            let audit = AuditLogger::daily(&dir).unwrap();
            for i in 0..BURST {
                audit.command(
                    i as u64,
                    "trade",
                    Some("EXNESS"),
                    &TradeResult::success(format!("ORD{}", i), "Trade executed successfully"),
                    Some(1),
                    "buy 0.01 XAUUSD",
                );
            }
        }

        let text: String = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
            .collect();
        let ids: std::collections::BTreeSet<u64> = text
            .lines()
            .map(|line| serde_json::from_str::<AuditRecord>(line).unwrap().session_id)
            .collect();
        assert_eq!(text.lines().count(), BURST);
        assert_eq!(ids.len(), BURST);

        std::fs::remove_dir_all(&dir).ok();
    }
}

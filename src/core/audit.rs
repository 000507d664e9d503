use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::utils::WafResult;

/// One blocked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub source_address: String,
    pub reason: String,
}

impl AuditRecord {
    /// `YYYY-MM-DD HH:MM:SS - IP: <addr> - Reason: <reason>`
    pub fn to_line(&self) -> String {
        format!(
            "{} - IP: {} - Reason: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.source_address,
            self.reason
        )
    }
}

/// Append-only destination for audit records.
///
/// Errors are reported to the caller, which logs and drops them.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> WafResult<()>;
}

/// Emits audit records as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> WafResult<()> {
        tracing::info!(
            target: "request_shield::audit",
            timestamp = %record.timestamp,
            source = %record.source_address,
            reason = %record.reason,
            "request blocked"
        );
        Ok(())
    }
}

/// Appends one line per record to a log file.
#[derive(Debug)]
pub struct FileAuditSink {
    path: PathBuf,
    // Serializes appends from concurrent requests within this process.
    write_lock: Mutex<()>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn record(&self, record: &AuditRecord) -> WafResult<()> {
        let mut line = record.to_line();
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

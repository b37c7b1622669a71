//! Append-only human readable record of administrative actions.

use thiserror::Error;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub const AUDIT_LOG_NAME: &str = "audit.log";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AuditLog {
    file: Arc<Mutex<File>>,
}

impl AuditLog {
    pub fn open(data_path: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(data_path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_path.join(AUDIT_LOG_NAME))?;
        Ok(AuditLog {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Failures are logged, never propagated; the log is a best-effort sink.
    pub fn entry(&self, message: &str) {
        tracing::info!(%message, "audit");
        let stamp = humantime::format_rfc3339_seconds(SystemTime::now());
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "[{stamp}] {message}") {
            tracing::warn!(error = %e, "failed writing audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn entries_are_appended() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let audit = AuditLog::open(tmp.path())?;
        audit.entry("Created new server \"alpha\".");
        audit.entry("Deleted server \"alpha\".");

        let content = fs::read_to_string(tmp.path().join(AUDIT_LOG_NAME))?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Created new server \"alpha\"."));
        assert!(lines[1].ends_with("Deleted server \"alpha\"."));
        Ok(())
    }
}

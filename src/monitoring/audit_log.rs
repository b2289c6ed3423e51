use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::ledger::types::AuditReport;

const HEADER: &str =
    "timestamp,account_id,cached_balance,ledger_balance,cached_lifetime_earned,ledger_lifetime_earned,transactions,status";

/// Append-only CSV trail of ledger audit results.
pub struct AuditCsvLogger {
    log_path: String,
}

impl AuditCsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)?;

            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self { log_path })
    }

    /// Log one audit report
    pub fn log_report(&self, report: &AuditReport) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        let status = if report.is_consistent() { "ok" } else { "MISMATCH" };

        writeln!(
            file,
            "{},{},{},{},{},{},{},{}",
            Utc::now().to_rfc3339(),
            report.account_id,
            report.cached_balance,
            report.ledger_balance,
            report.cached_lifetime_earned,
            report.ledger_lifetime_earned,
            report.transaction_count,
            status
        )?;

        Ok(())
    }

    /// Log a free-form maintenance event
    pub fn log_event(&self, event: &str) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        writeln!(file, "{},EVENT,,,,,,{}", Utc::now().to_rfc3339(), event)?;

        Ok(())
    }
}

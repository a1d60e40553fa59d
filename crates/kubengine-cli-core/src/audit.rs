use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{Datelike, Local};

use crate::CliError;

const LOG_ROTATE_BYTES: u64 = 20 * 1024 * 1024;
const CATEGORY: &str = "audit";

/// Appends one line to `<home>/logs/audit/YYYY-MM-DD.log`.
pub fn write_audit_log(home: &Path, message: &str) -> Result<(), CliError> {
    let log_dir = home.join("logs").join(CATEGORY);
    fs::create_dir_all(&log_dir)?;

    let now = Local::now();
    let filename = format!("{}-{:02}-{:02}.log", now.year(), now.month(), now.day());
    let log_path = log_dir.join(filename);

    rotate_if_needed(&log_path, now.timestamp());

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    writeln!(file, "[{}] {}", timestamp, message)?;
    Ok(())
}

/// Audit failures must never abort a deployment; they are logged instead.
pub fn audit(home: &Path, message: &str) {
    if let Err(err) = write_audit_log(home, message) {
        tracing::warn!(error = %err, "failed to write audit log");
    }
}

fn rotate_if_needed(path: &Path, ts: i64) {
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.is_file() && metadata.len() > LOG_ROTATE_BYTES {
            let rotated_name = format!("{}.{}.old", path.to_string_lossy(), ts);
            let _ = fs::rename(path, rotated_name);
        }
    }
}

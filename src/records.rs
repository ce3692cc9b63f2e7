// Accepted registrations are appended to a CSV file; the first append of
// each day also leaves a dated copy in the backup directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Registration;

pub const CSV_HEADER: [&str; 9] = [
    "Timestamp",
    "Full Name",
    "Email",
    "Phone",
    "Organization",
    "Attendees",
    "Payment Method",
    "Total Amount",
    "IP Address",
];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to write registration record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait RecordSink: Send + Sync {
    fn append(&self, registration: &Registration, at: DateTime<Local>) -> Result<(), RecordError>;
}

pub struct CsvRecordSink {
    path: PathBuf,
    backup_dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl CsvRecordSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    fn backup_path(&self, dir: &Path, at: &DateTime<Local>) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registrations".to_string());
        dir.join(format!("{}_{}.csv", stem, at.format("%Y-%m-%d")))
    }

    fn backup_once_per_day(&self, at: &DateTime<Local>) {
        let Some(dir) = &self.backup_dir else {
            return;
        };
        let backup = self.backup_path(dir, at);
        if backup.exists() {
            return;
        }
        match fs::create_dir_all(dir).and_then(|_| fs::copy(&self.path, &backup)) {
            Ok(_) => info!(backup = %backup.display(), "daily registration backup written"),
            Err(e) => warn!(backup = %backup.display(), error = %e, "daily registration backup failed"),
        }
    }
}

impl RecordSink for CsvRecordSink {
    fn append(&self, registration: &Registration, at: DateTime<Local>) -> Result<(), RecordError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let io_err = |source| RecordError::Io {
            path: self.path.clone(),
            source,
        };

        let is_new = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;

        let mut buf = String::new();
        if is_new {
            push_row(&mut buf, CSV_HEADER.iter().copied());
        }

        let timestamp = at.format("%Y-%m-%d %H:%M:%S").to_string();
        let attendees = registration.attendees.to_string();
        let total = registration.total_amount.to_string();
        push_row(
            &mut buf,
            [
                timestamp.as_str(),
                registration.full_name.as_str(),
                registration.email.as_str(),
                registration.phone.as_str(),
                registration.organization.as_str(),
                attendees.as_str(),
                registration.payment_method.as_str(),
                total.as_str(),
                registration.remote_addr.as_str(),
            ],
        );

        // one write per registration keeps rows whole
        file.write_all(buf.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        drop(file);

        self.backup_once_per_day(&at);
        Ok(())
    }
}

fn push_row<'a>(buf: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        push_field(buf, field);
    }
    buf.push('\n');
}

fn push_field(buf: &mut String, field: &str) {
    let needs_quotes = field.contains([',', '"', '\n', '\r', ' ', '\t']);
    if !needs_quotes {
        buf.push_str(field);
        return;
    }
    buf.push('"');
    for c in field.chars() {
        if c == '"' {
            buf.push('"');
        }
        buf.push(c);
    }
    buf.push('"');
}

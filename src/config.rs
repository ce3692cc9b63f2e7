use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::warn;

use crate::notify::EventDetails;
use crate::rate_limit::RateLimits;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerKind {
    // pipe to the local sendmail binary
    Sendmail,
    // log messages only
    Log,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStoreKind {
    // one JSON file per email hash under --rate-dir
    Fs,
    // in-process only, counters reset on restart
    Memory,
}

// CLI argument structure; every option can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "registration-gateway")]
#[command(about = "Event registration endpoint with per-email rate limiting")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // Max submissions per email per rolling hour
    #[arg(long, env = "MAX_PER_HOUR", default_value_t = 3)]
    pub max_per_hour: usize,

    // Max submissions per email per rolling 24 hours
    #[arg(long, env = "MAX_PER_DAY", default_value_t = 10)]
    pub max_per_day: usize,

    // Where rate records live
    #[arg(long, env = "RATE_STORE", value_enum, default_value_t = RateStoreKind::Fs)]
    pub rate_store: RateStoreKind,

    // Directory holding one JSON rate record per email hash
    #[arg(long, env = "RATE_DIR", default_value = "backups/ratelimit")]
    pub rate_dir: PathBuf,

    // Registration log
    #[arg(long, env = "CSV_FILE", default_value = "registrations.csv")]
    pub csv_file: PathBuf,

    // Daily CSV copies land here
    #[arg(long, env = "BACKUP_DIR", default_value = "backups")]
    pub backup_dir: PathBuf,

    #[arg(long, env = "ADMIN_EMAIL", default_value = "admin@localhost.localdomain")]
    pub admin_email: String,

    #[arg(long, env = "FROM_EMAIL", default_value = "noreply@localhost.localdomain")]
    pub from_email: String,

    #[arg(long, env = "EVENT_NAME", default_value = "Seminar")]
    pub event_name: String,

    // Price per attendee, whole currency units
    #[arg(long, env = "FEE_PER_ATTENDEE", default_value_t = 20_000)]
    pub fee_per_attendee: u64,

    #[arg(long, env = "MAILER", value_enum, default_value_t = MailerKind::Log)]
    pub mailer: MailerKind,

    #[arg(long, env = "SENDMAIL_PATH", default_value = "/usr/sbin/sendmail")]
    pub sendmail_path: PathBuf,

    // Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            max_per_hour: self.max_per_hour,
            max_per_day: self.max_per_day,
        }
    }

    pub fn event_details(&self) -> EventDetails {
        EventDetails {
            name: self.event_name.clone(),
            admin_email: self.admin_email.clone(),
            fee_per_attendee: self.fee_per_attendee,
        }
    }

    // Zero caps are legal but reject every submission
    pub fn warn_on_suspicious_limits(&self) {
        if self.max_per_hour == 0 {
            warn!("MAX_PER_HOUR is 0, every submission will be rate limited");
        }
        if self.max_per_day == 0 {
            warn!("MAX_PER_DAY is 0, every submission will be rate limited");
        }
        if self.max_per_day < self.max_per_hour {
            warn!(
                max_per_hour = self.max_per_hour,
                max_per_day = self.max_per_day,
                "daily cap is below the hourly cap"
            );
        }
    }
}

mod config;
mod error;
mod handlers;
mod metrics;
mod models;
mod notify;
mod rate_limit;
mod records;
mod state;
mod store;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, MailerKind, RateStoreKind};
use crate::notify::{LogMailer, Mailer, SendmailMailer};
use crate::rate_limit::RateLimiter;
use crate::records::{CsvRecordSink, RecordSink};
use crate::state::AppState;
use crate::store::{FsStore, MemoryStore, RateStore};

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("registration_gateway=info"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_state(args: &Args) -> Result<Arc<AppState>, String> {
    let store: Arc<dyn RateStore> = match args.rate_store {
        RateStoreKind::Fs => Arc::new(FsStore::open(&args.rate_dir).map_err(|e| e.to_string())?),
        RateStoreKind::Memory => {
            warn!("rate records kept in memory, limits reset on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let rate_limiter = Arc::new(RateLimiter::new(store, args.rate_limits()));

    if let Some(parent) = args.csv_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    let records: Arc<dyn RecordSink> =
        Arc::new(CsvRecordSink::new(&args.csv_file).with_backup_dir(&args.backup_dir));

    let mailer: Arc<dyn Mailer> = match args.mailer {
        MailerKind::Sendmail => Arc::new(SendmailMailer::new(&args.sendmail_path, &args.from_email)),
        MailerKind::Log => Arc::new(LogMailer),
    };

    Ok(Arc::new(AppState {
        rate_limiter,
        records,
        mailer,
        event: args.event_details(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

// this is main async function with tokio
#[tokio::main]
async fn main() -> ExitCode {
    // parse cli arguments
    let args = Args::parse();
    init_logging(args.log_json);
    args.warn_on_suspicious_limits();

    let state = match build_state(&args) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to initialise storage");
            return ExitCode::FAILURE;
        }
    };

    let limits = state.rate_limiter.limits();
    let app = handlers::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!("Registration gateway running on http://{}", addr);
    info!(
        "Rate limit: {} per hour, {} per day per email (records in {})",
        limits.max_per_hour,
        limits.max_per_day,
        args.rate_dir.display()
    );
    info!("Registrations appended to {}", args.csv_file.display());

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = served {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

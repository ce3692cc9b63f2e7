use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Form, Json,
    extract::{ConnectInfo, State},
};
use chrono::{Local, Utc};
use tracing::{error, info};

use crate::error::SubmitError;
use crate::metrics::{
    RATE_LIMITED, REGISTRATIONS_ACCEPTED, REQUEST_LATENCY, SUBMISSIONS_TOTAL, VALIDATION_REJECTED,
};
use crate::models::{RegistrationForm, RegistrationSummary, SubmitResponse};
use crate::notify::notify_registration;
use crate::rate_limit::{RateDecision, identity_key};
use crate::state::AppState;

pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(form): Form<RegistrationForm>,
) -> Result<Json<SubmitResponse>, SubmitError> {
    SUBMISSIONS_TOTAL.inc();
    let start_time = Instant::now();

    let registration = form
        .validate(state.event.fee_per_attendee, addr.ip().to_string())
        .inspect_err(|_| VALIDATION_REJECTED.inc())?;

    // limiter does blocking file I/O
    let limiter = Arc::clone(&state.rate_limiter);
    let email = registration.email.clone();
    let now = Utc::now().timestamp();
    let decision = tokio::task::spawn_blocking(move || limiter.check_and_record(&email, now))
        .await
        .map_err(|e| SubmitError::Internal(format!("rate limiter task failed: {}", e)))?;

    if let RateDecision::Denied {
        reason,
        retry_after_secs,
    } = decision
    {
        RATE_LIMITED.with_label_values(&[reason.as_str()]).inc();
        info!(
            key = %identity_key(&registration.email),
            reason = reason.as_str(),
            retry_after_secs,
            "submission rate limited"
        );
        return Err(SubmitError::RateLimited {
            reason,
            retry_after_secs,
        });
    }

    let records = Arc::clone(&state.records);
    let row = registration.clone();
    tokio::task::spawn_blocking(move || records.append(&row, Local::now()))
        .await
        .map_err(|e| SubmitError::Internal(format!("record task failed: {}", e)))?
        .map_err(|e| {
            error!(error = %e, "failed to append registration");
            SubmitError::RecordUnavailable
        })?;

    notify_registration(Arc::clone(&state.mailer), &state.event, &registration).await;

    REGISTRATIONS_ACCEPTED.inc();
    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());
    info!(
        key = %identity_key(&registration.email),
        attendees = registration.attendees,
        "registration saved"
    );

    Ok(Json(SubmitResponse {
        success: true,
        message: "Registration saved successfully!".to_string(),
        data: RegistrationSummary::from(&registration),
    }))
}

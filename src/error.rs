use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::rate_limit::LimitReason;

// Errors surfaced to the submitting client
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("{}", .reason.message())]
    RateLimited {
        reason: LimitReason,
        retry_after_secs: u64,
    },

    #[error("Unable to open CSV file")]
    RecordUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

// HH:MM:SS, hours keep counting past 24
pub fn format_countdown(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let message = self.to_string();

        match self {
            SubmitError::RateLimited {
                reason,
                retry_after_secs,
            } => {
                let body = Json(json!({
                    "success": false,
                    "message": message,
                    "reason": reason.as_str(),
                    "retry_after_seconds": retry_after_secs,
                    "retry_text": format!(
                        "Try again in {} (HH:MM:SS)",
                        format_countdown(retry_after_secs)
                    ),
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            other => {
                let status = match other {
                    SubmitError::MissingFields(_) | SubmitError::InvalidEmail => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = Json(json!({
                    "success": false,
                    "message": message,
                }));
                (status, body).into_response()
            }
        }
    }
}

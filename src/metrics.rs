use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Histogram, register_counter, register_counter_vec, register_histogram,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: Counter =
        register_counter!("registration_submissions_total", "Total number of submissions").unwrap();
    pub static ref REGISTRATIONS_ACCEPTED: Counter = register_counter!(
        "registration_accepted_total",
        "Submissions that passed validation and rate limiting and were recorded"
    )
    .unwrap();
    pub static ref VALIDATION_REJECTED: Counter = register_counter!(
        "registration_validation_rejected_total",
        "Submissions rejected for missing or invalid fields"
    )
    .unwrap();
    pub static ref RATE_LIMITED: CounterVec = register_counter_vec!(
        "registration_rate_limited_total",
        "Submissions denied by the per-email rate limiter",
        &["reason"]
    )
    .unwrap();
    pub static ref RATE_STORE_WRITE_FAILURES: Counter = register_counter!(
        "registration_rate_store_write_failures_total",
        "Rate records that could not be persisted"
    )
    .unwrap();
    pub static ref RATE_STORE_BAD_READS: Counter = register_counter!(
        "registration_rate_store_bad_reads_total",
        "Rate records that were unreadable or corrupt and treated as empty"
    )
    .unwrap();
    pub static ref EMAIL_FAILURES: Counter =
        register_counter!("registration_email_failures_total", "Emails that failed to send").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "registration_request_latency_seconds",
        "Submission latency in seconds"
    )
    .unwrap();
}

use std::sync::Arc;

use crate::notify::{EventDetails, Mailer};
use crate::rate_limit::RateLimiter;
use crate::records::RecordSink;

// app's shared state
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub records: Arc<dyn RecordSink>,
    pub mailer: Arc<dyn Mailer>,
    pub event: EventDetails,
}

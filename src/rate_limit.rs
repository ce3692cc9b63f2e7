use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::metrics::{RATE_STORE_BAD_READS, RATE_STORE_WRITE_FAILURES};
use crate::store::RateStore;

pub const HOUR_WINDOW_SECS: i64 = 3_600;
pub const DAY_WINDOW_SECS: i64 = 86_400;

// Upper bound on timestamps kept per identity
pub const MAX_STORED_EVENTS: usize = 500;

// Reported when a cap is zero and there is no event to measure from
pub const MIN_RETRY_AFTER_SECS: u64 = 1;

// Stored events further ahead of now than this are dropped as bogus
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub max_per_hour: usize,
    pub max_per_day: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_per_hour: 3,
            max_per_day: 10,
        }
    }
}

// Persisted shape: {"timestamps":[...]}
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    pub timestamps: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    Hourly,
    Daily,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::Hourly => "hourly_limit",
            LimitReason::Daily => "daily_limit",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            LimitReason::Hourly => "Hourly limit exceeded",
            LimitReason::Daily => "Daily limit exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        reason: LimitReason,
        retry_after_secs: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

// Storage key: hex SHA-256 of the lowercased address
pub fn identity_key(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

// Hourly cap is checked first, so it wins when both are exhausted
pub fn evaluate(events: &[i64], limits: RateLimits, now: i64) -> RateDecision {
    if let Some(retry_after_secs) = window_retry(events, limits.max_per_hour, HOUR_WINDOW_SECS, now) {
        return RateDecision::Denied {
            reason: LimitReason::Hourly,
            retry_after_secs,
        };
    }
    if let Some(retry_after_secs) = window_retry(events, limits.max_per_day, DAY_WINDOW_SECS, now) {
        return RateDecision::Denied {
            reason: LimitReason::Daily,
            retry_after_secs,
        };
    }
    RateDecision::Allowed
}

// Some(retry_after) when the window is full, None when there is room.
fn window_retry(events: &[i64], cap: usize, window: i64, now: i64) -> Option<u64> {
    if cap == 0 {
        return Some(MIN_RETRY_AFTER_SECS);
    }

    let cutoff = now.saturating_sub(window);
    let mut count = 0usize;
    let mut earliest = i64::MAX;
    for &t in events.iter().filter(|&&t| t >= cutoff) {
        count += 1;
        earliest = earliest.min(t);
    }

    if count < cap {
        return None;
    }

    let retry = earliest
        .saturating_add(window)
        .saturating_sub(now)
        .max(MIN_RETRY_AFTER_SECS as i64);
    Some(retry as u64)
}

pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    limits: RateLimits,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, limits: RateLimits) -> Self {
        Self {
            store,
            limits,
            locks: DashMap::new(),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    // Never fails: unreadable state counts as empty, a failed write is only logged
    pub fn check_and_record(&self, identity: &str, now: i64) -> RateDecision {
        let key = identity_key(identity);
        let lock = self.lock_for(&key);

        let decision = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.check_and_record_locked(&key, now)
        };

        drop(lock);
        self.locks.remove_if(&key, |_, m| Arc::strong_count(m) == 1);

        decision
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn check_and_record_locked(&self, key: &str, now: i64) -> RateDecision {
        let mut record = self.load_record(key);

        let before = record.timestamps.len();
        let oldest = now.saturating_sub(DAY_WINDOW_SECS);
        let newest = now.saturating_add(MAX_CLOCK_SKEW_SECS);
        record.timestamps.retain(|&t| t >= oldest && t <= newest);
        let pruned = before != record.timestamps.len();

        let decision = evaluate(&record.timestamps, self.limits, now);

        match decision {
            RateDecision::Allowed => {
                record.timestamps.push(now);
                if record.timestamps.len() > MAX_STORED_EVENTS {
                    let excess = record.timestamps.len() - MAX_STORED_EVENTS;
                    record.timestamps.drain(..excess);
                }
                self.persist(key, &record);
            }
            RateDecision::Denied { reason, retry_after_secs } => {
                debug!(key, reason = reason.as_str(), retry_after_secs, "rate limit hit");
                if pruned {
                    self.persist(key, &record);
                }
            }
        }

        decision
    }

    fn load_record(&self, key: &str) -> RateRecord {
        let bytes = match self.store.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return RateRecord::default(),
            Err(e) => {
                RATE_STORE_BAD_READS.inc();
                warn!(key, error = %e, "rate record unreadable, treating as empty");
                return RateRecord::default();
            }
        };

        match serde_json::from_slice::<RateRecord>(&bytes) {
            Ok(record) => record,
            Err(e) => {
                RATE_STORE_BAD_READS.inc();
                warn!(key, error = %e, "rate record corrupt, treating as empty");
                RateRecord::default()
            }
        }
    }

    fn persist(&self, key: &str, record: &RateRecord) {
        let result = serde_json::to_vec(record)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.store.store_atomic(key, &bytes).map_err(|e| e.to_string()));

        if let Err(e) = result {
            RATE_STORE_WRITE_FAILURES.inc();
            warn!(key, error = %e, "failed to persist rate record, next check for this identity is unenforced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsStore, MemoryStore, StoreError};
    use std::sync::Barrier;
    use std::thread;

    const EMAIL: &str = "guest@example.com";

    struct FailingStore {
        fail_reads: bool,
    }

    impl RateStore for FailingStore {
        fn load(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if self.fail_reads {
                Err(StoreError::InvalidKey("unreadable".to_string()))
            } else {
                Ok(None)
            }
        }

        fn store_atomic(&self, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::InvalidKey("read-only".to_string()))
        }
    }

    fn limiter(limits: RateLimits) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RateLimiter::new(store.clone(), limits), store)
    }

    fn stored(store: &MemoryStore, identity: &str) -> RateRecord {
        let bytes = store.load(&identity_key(identity)).unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_hourly_scenario() {
        let (limiter, store) = limiter(RateLimits::default());

        assert!(limiter.check_and_record(EMAIL, 0).is_allowed());
        assert!(limiter.check_and_record(EMAIL, 100).is_allowed());
        assert!(limiter.check_and_record(EMAIL, 200).is_allowed());

        assert_eq!(
            limiter.check_and_record(EMAIL, 300),
            RateDecision::Denied {
                reason: LimitReason::Hourly,
                retry_after_secs: 3300,
            }
        );

        assert!(limiter.check_and_record(EMAIL, 3601).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![0, 100, 200, 3601]);
    }

    #[test]
    fn test_denied_call_is_not_recorded() {
        let (limiter, store) = limiter(RateLimits::default());
        for t in [10, 20, 30] {
            assert!(limiter.check_and_record(EMAIL, t).is_allowed());
        }
        assert!(!limiter.check_and_record(EMAIL, 40).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_hourly_retry_after_is_bounded() {
        let (limiter, _) = limiter(RateLimits::default());
        for t in [1000, 1000, 1000] {
            assert!(limiter.check_and_record(EMAIL, t).is_allowed());
        }
        match limiter.check_and_record(EMAIL, 1000) {
            RateDecision::Denied { reason, retry_after_secs } => {
                assert_eq!(reason, LimitReason::Hourly);
                assert!(retry_after_secs > 0 && retry_after_secs <= 3600);
                assert_eq!(retry_after_secs, 3600);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_never_below_one() {
        // event exactly one hour old is still inside the window
        let events = [0, 0, 0];
        let decision = evaluate(&events, RateLimits::default(), HOUR_WINDOW_SECS);
        assert_eq!(
            decision,
            RateDecision::Denied {
                reason: LimitReason::Hourly,
                retry_after_secs: 1,
            }
        );
    }

    #[test]
    fn test_daily_limit() {
        let (limiter, _) = limiter(RateLimits::default());

        // two per trailing hour at most
        for i in 0..10 {
            assert!(limiter.check_and_record(EMAIL, i * 1800).is_allowed(), "call {}", i);
        }

        assert_eq!(
            limiter.check_and_record(EMAIL, 18_000),
            RateDecision::Denied {
                reason: LimitReason::Daily,
                retry_after_secs: 86_400 - 18_000,
            }
        );

        // earliest event leaves the day window
        assert!(limiter.check_and_record(EMAIL, 86_401).is_allowed());
    }

    #[test]
    fn test_hourly_reported_when_both_caps_full() {
        let limits = RateLimits {
            max_per_hour: 2,
            max_per_day: 2,
        };
        let decision = evaluate(&[100, 200], limits, 300);
        assert!(matches!(
            decision,
            RateDecision::Denied {
                reason: LimitReason::Hourly,
                ..
            }
        ));
    }

    #[test]
    fn test_old_events_are_pruned_from_store() {
        let (limiter, store) = limiter(RateLimits::default());
        store.insert_raw(
            &identity_key(EMAIL),
            serde_json::to_vec(&RateRecord {
                timestamps: vec![1, 2, 3, 50_000],
            })
            .unwrap(),
        );

        let now = 1 + DAY_WINDOW_SECS + 10;
        assert!(limiter.check_and_record(EMAIL, now).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![50_000, now]);
    }

    #[test]
    fn test_prune_persisted_on_denial() {
        let limits = RateLimits {
            max_per_hour: 1,
            max_per_day: 10,
        };
        let (limiter, store) = limiter(limits);
        let now = 200_000;
        store.insert_raw(
            &identity_key(EMAIL),
            serde_json::to_vec(&RateRecord {
                timestamps: vec![5, now - 10],
            })
            .unwrap(),
        );

        assert!(!limiter.check_and_record(EMAIL, now).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![now - 10]);
    }

    #[test]
    fn test_corrupt_record_treated_as_empty() {
        let (limiter, store) = limiter(RateLimits::default());
        store.insert_raw(&identity_key(EMAIL), "{not json");
        assert!(limiter.check_and_record(EMAIL, 500).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![500]);

        store.insert_raw(&identity_key(EMAIL), r#"{"timestamps":"nope"}"#);
        assert!(limiter.check_and_record(EMAIL, 600).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![600]);
    }

    #[test]
    fn test_unreadable_store_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore { fail_reads: true }), RateLimits::default());
        for t in 0..5 {
            assert!(limiter.check_and_record(EMAIL, t).is_allowed());
        }
    }

    #[test]
    fn test_write_failure_still_allows() {
        let limiter = RateLimiter::new(Arc::new(FailingStore { fail_reads: false }), RateLimits::default());
        assert!(limiter.check_and_record(EMAIL, 0).is_allowed());
    }

    #[test]
    fn test_zero_hourly_cap_denies_first_call() {
        let (limiter, store) = limiter(RateLimits {
            max_per_hour: 0,
            max_per_day: 10,
        });
        assert_eq!(
            limiter.check_and_record(EMAIL, 0),
            RateDecision::Denied {
                reason: LimitReason::Hourly,
                retry_after_secs: MIN_RETRY_AFTER_SECS,
            }
        );
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_zero_daily_cap_denies_first_call() {
        let (limiter, _) = limiter(RateLimits {
            max_per_hour: 3,
            max_per_day: 0,
        });
        assert_eq!(
            limiter.check_and_record(EMAIL, 0),
            RateDecision::Denied {
                reason: LimitReason::Daily,
                retry_after_secs: MIN_RETRY_AFTER_SECS,
            }
        );
    }

    #[test]
    fn test_record_truncated_to_newest_500() {
        let (limiter, store) = limiter(RateLimits {
            max_per_hour: 1_000,
            max_per_day: 1_000,
        });
        for t in 0..501 {
            assert!(limiter.check_and_record(EMAIL, t).is_allowed());
        }
        let record = stored(&store, EMAIL);
        assert_eq!(record.timestamps.len(), MAX_STORED_EVENTS);
        assert_eq!(record.timestamps.first(), Some(&1));
        assert_eq!(record.timestamps.last(), Some(&500));
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        let (limiter, _) = limiter(RateLimits::default());
        assert!(limiter.check_and_record("Guest@Example.com", 0).is_allowed());
        assert!(limiter.check_and_record("GUEST@EXAMPLE.COM", 1).is_allowed());
        assert!(limiter.check_and_record("guest@example.com", 2).is_allowed());
        assert!(!limiter.check_and_record("guest@EXAMPLE.com", 3).is_allowed());
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _) = limiter(RateLimits::default());
        for t in 0..3 {
            assert!(limiter.check_and_record("a@example.com", t).is_allowed());
        }
        assert!(!limiter.check_and_record("a@example.com", 3).is_allowed());
        assert!(limiter.check_and_record("b@example.com", 3).is_allowed());
    }

    #[test]
    fn test_identity_key_is_hex_digest() {
        let key = identity_key("Guest@Example.com");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!key.contains("guest"));
        assert_eq!(key, identity_key("guest@example.com"));
        assert_ne!(key, identity_key("other@example.com"));
    }

    #[test]
    fn test_far_future_events_are_discarded() {
        let (limiter, store) = limiter(RateLimits::default());
        let now = 1_700_000_000;
        store.insert_raw(
            &identity_key(EMAIL),
            serde_json::to_vec(&RateRecord {
                timestamps: vec![i64::MAX, i64::MAX, i64::MAX, now + 60],
            })
            .unwrap(),
        );

        assert!(limiter.check_and_record(EMAIL, now).is_allowed());
        assert_eq!(stored(&store, EMAIL).timestamps, vec![now + 60, now]);
        assert!(limiter.locks.is_empty());
    }

    #[test]
    fn test_evaluate_saturates_on_extreme_timestamps() {
        let decision = evaluate(&[i64::MAX; 3], RateLimits::default(), 1_700_000_000);
        match decision {
            RateDecision::Denied { reason, retry_after_secs } => {
                assert_eq!(reason, LimitReason::Hourly);
                assert!(retry_after_secs >= MIN_RETRY_AFTER_SECS);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        let decision = evaluate(&[i64::MIN; 3], RateLimits::default(), i64::MIN);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_concurrent_same_identity_respects_cap() {
        let (limiter, store) = limiter(RateLimits::default());
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    limiter.check_and_record(EMAIL, 1_000).is_allowed()
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        assert_eq!(allowed, 3);
        assert_eq!(stored(&store, EMAIL).timestamps.len(), 3);
        assert!(limiter.locks.is_empty());
    }

    #[test]
    fn test_fs_store_backed_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::open(dir.path()).unwrap());
        let limiter = RateLimiter::new(store, RateLimits::default());

        for t in [0, 100, 200] {
            assert!(limiter.check_and_record(EMAIL, t).is_allowed());
        }

        // a fresh limiter over the same directory sees the persisted events
        let store = Arc::new(FsStore::new(dir.path()));
        let limiter = RateLimiter::new(store, RateLimits::default());
        assert!(!limiter.check_and_record(EMAIL, 300).is_allowed());

        let path = dir.path().join(format!("{}.json", identity_key(EMAIL)));
        let raw = std::fs::read_to_string(path).unwrap();
        assert_eq!(raw, r#"{"timestamps":[0,100,200]}"#);
    }
}

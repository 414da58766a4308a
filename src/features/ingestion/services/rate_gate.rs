//! Per-key minimum-interval gate
//!
//! Tracks the last accepted instant (milliseconds since epoch) for every
//! throttle key and decides whether a new message for that key may be saved.
//! Only acceptance mutates the state; rejected or malformed messages never do.
//!
//! # Memory Management
//!
//! Keys are held in an LRU map bounded by `max_keys`. When a new key arrives
//! at capacity the least recently used key is forgotten, so its next message
//! is treated as a first message.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

/// When the gate records an acceptance relative to the persistence write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Commit as soon as the message passes the gate. A failed write still
    /// consumes the throttle window for its key.
    BeforeWrite,
    /// Reserve the key while the write is in flight and commit only on
    /// success. A failed write leaves the previous window untouched.
    AfterWrite,
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "before_write" => Ok(CommitStrategy::BeforeWrite),
            "after_write" => Ok(CommitStrategy::AfterWrite),
            other => Err(format!(
                "expected 'before_write' or 'after_write', got '{}'",
                other
            )),
        }
    }
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStrategy::BeforeWrite => write!(f, "before_write"),
            CommitStrategy::AfterWrite => write!(f, "after_write"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    last_accepted: Option<i64>,
    /// Set while an after-write commit is pending for this key
    in_flight: bool,
}

pub struct RateGate {
    min_interval_ms: i64,
    entries: Mutex<LruCache<String, KeyState>>,
}

impl RateGate {
    pub fn new(min_interval: Duration, max_keys: usize) -> Self {
        let capacity = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            // Round up so a fractional interval never admits a message early
            min_interval_ms: i64::try_from(min_interval.as_nanos().div_ceil(1_000_000))
                .unwrap_or(i64::MAX),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// A zero interval accepts every message
    pub fn is_disabled(&self) -> bool {
        self.min_interval_ms == 0
    }

    /// Would a message for `key` arriving at `now_ms` be accepted?
    ///
    /// Read-only; callers that act on the answer must follow up with
    /// [`commit`](Self::commit), or use [`admit`](Self::admit) to do both atomically.
    #[allow(dead_code)]
    pub fn should_accept(&self, key: &str, now_ms: i64) -> bool {
        let entries = self.entries.lock();
        self.allows(entries.peek(key), now_ms)
    }

    /// Record an acceptance for `key` at `now_ms`
    ///
    /// Repeating a commit with the same instant leaves the state unchanged, and
    /// the recorded instant never moves backwards.
    #[allow(dead_code)]
    pub fn commit(&self, key: &str, now_ms: i64) {
        let mut entries = self.entries.lock();
        Self::commit_locked(&mut entries, key, now_ms);
    }

    /// Check and commit under a single lock
    pub fn admit(&self, key: &str, now_ms: i64) -> bool {
        let mut entries = self.entries.lock();
        if !self.allows(entries.peek(key), now_ms) {
            return false;
        }
        Self::commit_locked(&mut entries, key, now_ms);
        true
    }

    /// Check and mark `key` as having a write in flight
    ///
    /// While reserved, further messages for the key are rejected. Every
    /// successful reservation must be followed by [`settle`](Self::settle).
    pub fn reserve(&self, key: &str, now_ms: i64) -> bool {
        if self.is_disabled() {
            return true;
        }
        let mut entries = self.entries.lock();
        if !self.allows(entries.peek(key), now_ms) {
            return false;
        }
        match entries.get_mut(key) {
            Some(state) => state.in_flight = true,
            None => {
                entries.put(
                    key.to_string(),
                    KeyState {
                        last_accepted: None,
                        in_flight: true,
                    },
                );
            }
        }
        true
    }

    /// Release a reservation, committing `accepted_at` when the write succeeded
    pub fn settle(&self, key: &str, accepted_at: i64, succeeded: bool) {
        let mut entries = self.entries.lock();
        if let Some(state) = entries.peek_mut(key) {
            state.in_flight = false;
        }
        if succeeded {
            Self::commit_locked(&mut entries, key, accepted_at);
        }
    }

    #[allow(dead_code)]
    pub fn last_accepted(&self, key: &str) -> Option<i64> {
        self.entries.lock().peek(key).and_then(|s| s.last_accepted)
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    fn allows(&self, state: Option<&KeyState>, now_ms: i64) -> bool {
        if self.is_disabled() {
            return true;
        }
        let Some(state) = state else {
            return true;
        };
        if state.in_flight {
            return false;
        }
        match state.last_accepted {
            Some(last) => now_ms.saturating_sub(last) >= self.min_interval_ms,
            None => true,
        }
    }

    fn commit_locked(entries: &mut LruCache<String, KeyState>, key: &str, now_ms: i64) {
        match entries.get_mut(key) {
            Some(state) => {
                state.last_accepted = Some(state.last_accepted.map_or(now_ms, |t| t.max(now_ms)));
            }
            None => {
                entries.put(
                    key.to_string(),
                    KeyState {
                        last_accepted: Some(now_ms),
                        in_flight: false,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE_MS: i64 = 60_000;

    fn gate(secs: u64) -> RateGate {
        RateGate::new(Duration::from_secs(secs), 1_000)
    }

    #[test]
    fn test_first_message_is_accepted() {
        let gate = gate(60);
        assert!(gate.should_accept("sensor/1", 0));
        assert!(gate.admit("sensor/1", 0));
    }

    #[test]
    fn test_rejects_within_interval_and_accepts_at_boundary() {
        let gate = gate(60);
        assert!(gate.admit("sensor/1", 0));

        assert!(!gate.should_accept("sensor/1", 30_000));
        assert!(!gate.admit("sensor/1", MINUTE_MS - 1));
        assert!(gate.admit("sensor/1", MINUTE_MS));
    }

    #[test]
    fn test_rejection_does_not_mutate_state() {
        let gate = gate(60);
        assert!(gate.admit("sensor/1", 0));
        assert!(!gate.admit("sensor/1", 30_000));
        assert_eq!(gate.last_accepted("sensor/1"), Some(0));

        // Acceptance right after the window behaves as if the reject never happened
        assert!(gate.admit("sensor/1", MINUTE_MS));
    }

    #[test]
    fn test_keys_are_independent() {
        let gate = gate(60);
        assert!(gate.admit("sensor/1", 0));
        assert!(gate.admit("sensor/2", 1));
        assert!(!gate.admit("sensor/1", 2));
        assert_eq!(gate.last_accepted("sensor/2"), Some(1));
    }

    #[test]
    fn test_zero_interval_accepts_everything() {
        let gate = gate(0);
        assert!(gate.is_disabled());
        for t in 0..100 {
            assert!(gate.admit("sensor/1", t / 10));
        }
        assert!(gate.reserve("sensor/1", 5));
        assert!(gate.reserve("sensor/1", 5));
    }

    #[test]
    fn test_fractional_interval_rounds_up() {
        let gate = RateGate::new(Duration::from_secs_f64(1.9999), 1_000);
        assert!(gate.admit("sensor/1", 0));
        assert!(!gate.admit("sensor/1", 1_999));
        assert!(gate.admit("sensor/1", 2_000));
    }

    #[test]
    fn test_sub_millisecond_interval_still_throttles() {
        let gate = RateGate::new(Duration::from_micros(900), 1_000);
        assert!(!gate.is_disabled());
        assert!(gate.admit("sensor/1", 0));
        assert!(!gate.admit("sensor/1", 0));
        assert!(gate.admit("sensor/1", 1));
    }

    #[test]
    fn test_commit_is_idempotent_and_monotonic() {
        let gate = gate(60);
        gate.commit("sensor/1", 1_000);
        gate.commit("sensor/1", 1_000);
        assert_eq!(gate.last_accepted("sensor/1"), Some(1_000));

        gate.commit("sensor/1", 500);
        assert_eq!(gate.last_accepted("sensor/1"), Some(1_000));
    }

    #[test]
    fn test_clock_moving_backwards_is_throttled() {
        let gate = gate(60);
        assert!(gate.admit("sensor/1", MINUTE_MS));
        assert!(!gate.admit("sensor/1", 0));
    }

    #[test]
    fn test_reservation_blocks_until_settled() {
        let gate = gate(60);
        assert!(gate.reserve("sensor/1", 0));
        assert!(!gate.reserve("sensor/1", 10));
        assert!(!gate.should_accept("sensor/1", 10 * MINUTE_MS));

        gate.settle("sensor/1", 0, true);
        assert_eq!(gate.last_accepted("sensor/1"), Some(0));
        assert!(!gate.reserve("sensor/1", 10));
        assert!(gate.reserve("sensor/1", MINUTE_MS));
    }

    #[test]
    fn test_failed_settle_keeps_previous_window() {
        let gate = gate(60);
        assert!(gate.reserve("sensor/1", 0));
        gate.settle("sensor/1", 0, false);

        assert_eq!(gate.last_accepted("sensor/1"), None);
        assert!(gate.reserve("sensor/1", 1));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let gate = RateGate::new(Duration::from_secs(60), 2);
        assert!(gate.admit("a", 0));
        assert!(gate.admit("b", 0));
        assert!(gate.admit("c", 0));

        assert_eq!(gate.tracked_keys(), 2);
        assert_eq!(gate.last_accepted("a"), None);
        // Forgotten key behaves as a first message
        assert!(gate.admit("a", 1));
    }

    #[test]
    fn test_concurrent_admit_accepts_once_per_key() {
        let gate = Arc::new(gate(60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || (0..100).filter(|_| gate.admit("sensor/1", 0)).count())
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_commit_strategy_parse() {
        assert_eq!("before_write".parse::<CommitStrategy>().unwrap(), CommitStrategy::BeforeWrite);
        assert_eq!("after_write".parse::<CommitStrategy>().unwrap(), CommitStrategy::AfterWrite);
        assert!("never".parse::<CommitStrategy>().is_err());
        assert_eq!(CommitStrategy::AfterWrite.to_string(), "after_write");
    }
}

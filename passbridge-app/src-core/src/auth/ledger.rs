//! Per-username login rate limiting.
//!
//! Each username moves through `Clean -> Attempting(n) -> Blocked(until)`.
//! The ledger must be consulted before any password hash is computed so a
//! blocked identity never reaches the expensive (and timing-sensitive)
//! verify path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AppError, Result};

/// Failures allowed before a block.
pub const MAX_ATTEMPTS: u32 = 5;
/// Inactivity after which a username's attempts are forgotten.
pub const ATTEMPT_WINDOW_MINUTES: i64 = 15;
/// First lockout duration.
pub const BASE_LOCKOUT_MINUTES: i64 = 5;
/// Lockout ceiling.
pub const MAX_LOCKOUT_MINUTES: i64 = 30;
/// Records idle this long are dropped by [`AuthLedger::sweep`].
pub const IDLE_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub blocked: bool,
    pub wait_seconds: u64,
    pub attempts_remaining: u32,
}

impl RateLimitStatus {
    fn clean() -> Self {
        Self {
            blocked: false,
            wait_seconds: 0,
            attempts_remaining: MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerState {
    Clean,
    Attempting(u32),
    Blocked(DateTime<Utc>),
}

#[derive(Debug, Clone)]
struct RateLimitRecord {
    count: u32,
    window_start: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
    /// Completed blocks since the record was created; each one doubles the next lockout.
    strikes: u32,
}

impl RateLimitRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_activity: now,
            blocked_until: None,
            strikes: 0,
        }
    }

    /// Clear an elapsed block, restoring the attempt budget.
    fn release_expired_block(&mut self, now: DateTime<Utc>) {
        if let Some(until) = self.blocked_until {
            if until <= now {
                self.blocked_until = None;
                self.count = 0;
                self.window_start = now;
                self.last_activity = self.last_activity.max(until);
                self.strikes = self.strikes.saturating_add(1);
            }
        }
    }
}

pub struct AuthLedger {
    records: Mutex<HashMap<String, RateLimitRecord>>,
    clock: Arc<dyn Clock>,
}

impl AuthLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn key(username: &str) -> String {
        username.trim().to_lowercase()
    }

    /// Report whether `username` may attempt a login right now.
    pub fn check_rate_limit(&self, username: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let key = Self::key(username);
        let mut records = self.records.lock();

        let Some(record) = records.get_mut(&key) else {
            return RateLimitStatus::clean();
        };

        if let Some(until) = record.blocked_until {
            if until > now {
                return RateLimitStatus {
                    blocked: true,
                    wait_seconds: ceil_seconds(until - now),
                    attempts_remaining: 0,
                };
            }
        }
        record.release_expired_block(now);

        if now - record.last_activity >= Duration::minutes(ATTEMPT_WINDOW_MINUTES) {
            debug!("Attempt window elapsed for {}, resetting", key);
            records.remove(&key);
            return RateLimitStatus::clean();
        }

        RateLimitStatus {
            blocked: false,
            wait_seconds: 0,
            attempts_remaining: MAX_ATTEMPTS.saturating_sub(record.count),
        }
    }

    /// Fail with `RateLimited` when the username is currently blocked.
    pub fn ensure_allowed(&self, username: &str) -> Result<RateLimitStatus> {
        let status = self.check_rate_limit(username);
        if status.blocked {
            return Err(AppError::RateLimited {
                wait_seconds: status.wait_seconds,
            });
        }
        Ok(status)
    }

    /// Record a failed attempt, blocking once the budget is exhausted.
    pub fn record_failure(&self, username: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let key = Self::key(username);
        let mut records = self.records.lock();

        let record = records
            .entry(key.clone())
            .or_insert_with(|| RateLimitRecord::new(now));

        record.release_expired_block(now);
        if record.blocked_until.is_none()
            && now - record.last_activity >= Duration::minutes(ATTEMPT_WINDOW_MINUTES)
        {
            *record = RateLimitRecord::new(now);
        }

        record.count += 1;
        record.last_activity = now;

        if record.count < MAX_ATTEMPTS {
            return RateLimitStatus {
                blocked: false,
                wait_seconds: 0,
                attempts_remaining: MAX_ATTEMPTS - record.count,
            };
        }

        let excess = record.count - MAX_ATTEMPTS;
        let lockout = lockout_duration(record.strikes.saturating_add(excess));
        let until = now + lockout;
        record.blocked_until = Some(until);
        warn!(
            "Blocking login for {} for {} seconds after {} failed attempts since {}",
            key,
            lockout.num_seconds(),
            record.count,
            record.window_start
        );

        RateLimitStatus {
            blocked: true,
            wait_seconds: ceil_seconds(until - now),
            attempts_remaining: 0,
        }
    }

    /// Forget the username's history after a successful login.
    pub fn record_success(&self, username: &str) {
        let key = Self::key(username);
        if self.records.lock().remove(&key).is_some() {
            debug!("Cleared failed attempts for {}", key);
        }
    }

    pub fn state(&self, username: &str) -> LedgerState {
        let now = self.clock.now();
        let records = self.records.lock();
        match records.get(&Self::key(username)) {
            None => LedgerState::Clean,
            Some(r) => match r.blocked_until {
                Some(until) if until > now => LedgerState::Blocked(until),
                Some(_) => LedgerState::Clean,
                None => LedgerState::Attempting(r.count),
            },
        }
    }

    /// Drop records idle longer than an hour. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = Duration::minutes(IDLE_EXPIRY_MINUTES);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| {
            let still_blocked = r.blocked_until.is_some_and(|until| until > now);
            still_blocked || now - r.last_activity < idle
        });
        let removed = before - records.len();
        if removed > 0 {
            info!("Swept {} idle login rate-limit records", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuthLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// `BASE * 2^exponent`, capped.
fn lockout_duration(exponent: u32) -> Duration {
    let minutes = BASE_LOCKOUT_MINUTES.saturating_mul(1i64 << exponent.min(16));
    Duration::minutes(minutes.min(MAX_LOCKOUT_MINUTES))
}

fn ceil_seconds(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

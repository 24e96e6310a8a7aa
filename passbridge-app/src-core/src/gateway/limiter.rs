//! Per-connection message rate limits.
//!
//! Pairing attempts and credential requests have independent budgets, each
//! counted over a fixed 60-second window. Going over budget blocks that kind
//! of message on that connection for five minutes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::registry::ConnectionId;
use crate::clock::{Clock, SystemClock};

pub const WINDOW_SECONDS: i64 = 60;
pub const BLOCK_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Pair,
    Request,
}

impl LimitKind {
    pub fn max_per_window(self) -> u32 {
        match self {
            LimitKind::Pair => 5,
            LimitKind::Request => 20,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LimitKind::Pair => "pairing",
            LimitKind::Request => "credential request",
        }
    }
}

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    window_start: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

pub struct ConnectionLimiter {
    windows: Mutex<HashMap<(ConnectionId, LimitKind), Window>>,
    clock: Arc<dyn Clock>,
}

impl ConnectionLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Count one message. `Err(wait_seconds)` when the budget is exhausted.
    pub fn check(&self, conn: ConnectionId, kind: LimitKind) -> Result<(), u64> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let window = windows.entry((conn, kind)).or_insert_with(|| Window {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = window.blocked_until {
            if until > now {
                return Err(ceil_seconds(until - now));
            }
            window.blocked_until = None;
            window.count = 0;
            window.window_start = now;
        }

        if now - window.window_start >= Duration::seconds(WINDOW_SECONDS) {
            window.count = 0;
            window.window_start = now;
        }

        window.count += 1;
        if window.count > kind.max_per_window() {
            let until = now + Duration::minutes(BLOCK_MINUTES);
            window.blocked_until = Some(until);
            warn!(
                "{}: too many {} messages, blocking for {} minutes",
                conn,
                kind.label(),
                BLOCK_MINUTES
            );
            return Err(ceil_seconds(until - now));
        }
        Ok(())
    }

    pub fn clear(&self, conn: ConnectionId, kind: LimitKind) {
        self.windows.lock().remove(&(conn, kind));
    }

    pub fn remove_connection(&self, conn: ConnectionId) {
        self.windows.lock().retain(|(id, _), _| *id != conn);
    }

    /// Drop windows that are neither blocking nor within their period.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let period = Duration::seconds(WINDOW_SECONDS);
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.blocked_until.is_some_and(|until| until > now) || now - w.window_start < period
        });
        let removed = before - windows.len();
        if removed > 0 {
            debug!("Swept {} idle connection rate-limit windows", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn ceil_seconds(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

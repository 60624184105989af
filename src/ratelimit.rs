//! Sliding-window limit on a peer's outbound sends.
//!
//! A peer configured with [`RateLimit`] may send at most `max_messages` direct
//! or group messages within any `window`. Timestamps of recent sends are kept
//! in a queue and expired lazily on each check.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default number of sends allowed per window.
pub const DEFAULT_RATE_LIMIT_MESSAGES: usize = 10;

/// Default window length.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    /// Sends allowed inside one window.
    pub max_messages: usize,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_RATE_LIMIT_MESSAGES,
            window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: RateLimit,
    send_times: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            send_times: VecDeque::new(),
        }
    }

    /// Record a send if the window has room.
    ///
    /// Returns `true` when the send is rate limited (nothing recorded).
    pub fn check_and_record(&mut self) -> bool {
        let now = Instant::now();

        while let Some(front) = self.send_times.front() {
            if now.duration_since(*front) >= self.limit.window {
                self.send_times.pop_front();
            } else {
                break;
            }
        }

        if self.send_times.len() >= self.limit.max_messages {
            return true;
        }

        self.send_times.push_back(now);
        false
    }
}

// Sliding-window budget of registry calls for one endpoint.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RateBudget {
    max_checks: u32,
    window: Duration,
    /// Times of the calls still inside the window, oldest first.
    used: VecDeque<DateTime<Utc>>,
}

impl RateBudget {
    pub fn new(max_checks: u32, window: Duration) -> Self {
        Self {
            max_checks,
            window,
            used: VecDeque::with_capacity(max_checks as usize),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.used.front().is_some_and(|t| *t <= cutoff) {
            self.used.pop_front();
        }
    }

    /// Check and consume one unit as a single step. `false` means exhausted; nothing is consumed.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        if self.used.len() >= self.max_checks as usize {
            return false;
        }
        self.used.push_back(now);
        true
    }

    pub fn used(&mut self, now: DateTime<Utc>) -> u32 {
        self.evict(now);
        self.used.len() as u32
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> u32 {
        self.max_checks.saturating_sub(self.used(now))
    }

    /// When the oldest counted call leaves the window; `None` while budget is left.
    pub fn next_available_at(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.remaining(now) > 0 {
            return None;
        }
        self.used.front().map(|t| *t + self.window)
    }

    /// Re-populate from persisted call times. Entries outside the window are ignored and the
    /// maximum still holds.
    pub fn restore(&mut self, mut times: Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        times.sort();
        for t in times {
            if t <= now - self.window || t > now {
                continue;
            }
            if self.used.len() >= self.max_checks as usize {
                break;
            }
            self.used.push_back(t);
        }
        self.used.make_contiguous().sort();
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_checks(&self) -> u32 {
        self.max_checks
    }
}

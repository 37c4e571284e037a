//! Per-client sliding window request counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Run a sweep of idle clients every this many checks.
const SWEEP_EVERY: u64 = 1000;

/// Advisory rate tracker.  `check` reports whether a client has exceeded the
/// threshold inside the trailing window; it never rejects anything itself.
///
/// Each client's window is locked independently (one `DashMap` shard entry),
/// so unrelated clients do not serialise on each other.
pub struct RateTracker {
    windows: DashMap<String, VecDeque<Instant>>,
    threshold: usize,
    window: Duration,
    checks: AtomicU64,
}

impl RateTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            threshold,
            window,
            checks: AtomicU64::new(0),
        }
    }

    /// Record a request from `client_ip` at `now`; true when the count inside
    /// the window now exceeds the threshold.
    pub fn check(&self, client_ip: &str, now: Instant) -> bool {
        let over = {
            let mut timestamps = self.windows.entry(client_ip.to_owned()).or_default();
            self.prune(&mut timestamps, now);
            timestamps.push_back(now);
            // Only the newest threshold+1 entries can decide "exceeds".
            while timestamps.len() > self.threshold.saturating_add(1) {
                timestamps.pop_front();
            }
            timestamps.len() > self.threshold
        };
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        over
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop clients whose newest request has left the window.
    pub fn sweep(&self, now: Instant) {
        let window = self.window;
        self.windows.retain(|_, timestamps| {
            timestamps
                .back()
                .map(|newest| now.saturating_duration_since(*newest) < window)
                .unwrap_or(false)
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admits at most `max_count` operations per source IP within each
/// wall-clock interval. Counters (and the memory behind them) are discarded
/// wholesale at every interval rollover.
pub struct RateLimiter {
    max_count: usize,
    interval: Duration,
    window: Mutex<Window>,
}

struct Window {
    started: Instant,
    counters: HashMap<IpAddr, usize>,
}

impl RateLimiter {
    pub fn new(max_count: usize, interval: Duration) -> Self {
        RateLimiter {
            max_count,
            interval,
            window: Mutex::new(Window {
                started: Instant::now(),
                counters: HashMap::new(),
            }),
        }
    }

    /// Returns true if the source IP may carry out one more operation in the
    /// current interval.
    pub fn admit(&self, ip: IpAddr) -> bool {
        self.admit_at(ip, Instant::now())
    }

    fn admit_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.duration_since(window.started) >= self.interval {
            window.started = now;
            window.counters.clear();
        }

        let count = window.counters.entry(ip).or_insert(0);
        *count += 1;
        if *count > self.max_count {
            tracing::debug!(%ip, count, "rate limit exceeded");
            false
        } else {
            true
        }
    }
}

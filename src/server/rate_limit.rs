// Per-IP Rate Limiting
// Fixed one-minute windows keyed by client address. State lives in a
// DashMap; entries are swept lazily so the map cannot grow unbounded.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// How many checks between sweeps of expired windows
const SWEEP_INTERVAL: u64 = 1024;

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    max_per_window: u32,
    hits: DashMap<IpAddr, Window>,
    checks: std::sync::atomic::AtomicU64,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_window: max_per_minute,
            hits: DashMap::new(),
            checks: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Count a request from `ip`; false means over the limit
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= WINDOW {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        let allowed = entry.count <= self.max_per_window;
        drop(entry);

        let n = self
            .checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if n % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep();
        }

        allowed
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.hits
            .retain(|_, w| now.duration_since(w.started) < WINDOW);
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.hits.len()
    }
}

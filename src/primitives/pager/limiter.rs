use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Cooperative back-pressure hook called while dirty pages are flushed.
///
/// `pace` runs on the flushing thread after every batch and may sleep.
pub trait IoLimiter: Send + Sync {
    /// Reports that `pages_flushed` more pages were written.
    fn pace(&self, pages_flushed: usize);
}

/// Limiter that never pauses.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

impl IoLimiter for Unlimited {
    fn pace(&self, _pages_flushed: usize) {}
}

/// Caps flushed pages per time window by sleeping out the rest of the window.
pub struct RateLimiter {
    limit: u64,
    window: Duration,
    state: Mutex<Window>,
    pauses: AtomicU64,
}

struct Window {
    started: Instant,
    pages: u64,
}

impl RateLimiter {
    /// Allows at most `limit` pages per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                pages: 0,
            }),
            pauses: AtomicU64::new(0),
        }
    }

    /// Allows at most `pages` pages per second.
    pub fn pages_per_second(pages: u64) -> Self {
        Self::new(pages, Duration::from_secs(1))
    }

    /// Number of times the limiter slept.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

impl IoLimiter for RateLimiter {
    fn pace(&self, pages_flushed: usize) {
        let mut state = self.state.lock();
        let elapsed = state.started.elapsed();
        if elapsed >= self.window {
            state.started = Instant::now();
            state.pages = 0;
        }
        state.pages += pages_flushed as u64;
        if state.pages <= self.limit {
            return;
        }
        let wait = self.window.saturating_sub(state.started.elapsed());
        debug!(
            target: "gbptree::limiter",
            pages = state.pages,
            limit = self.limit,
            wait_ms = wait.as_millis() as u64,
            "flush rate exceeded; pausing"
        );
        self.pauses.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(wait);
        state.started = Instant::now();
        state.pages = 0;
    }
}

//! Token-bucket-style publish throttling.
//!
//! Each [`Throttler`] enforces "at most `max_in_interval` sends within any
//! `interval` window" using a deque of monotonic send timestamps, matching
//! `RateLimiter.py`'s sliding-window approach. Several throttlers are
//! chained in series (per `Config::throttle_stages`) and applied before
//! every publish; waiting is interruptible so shutdown is not blocked on a
//! throttle window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ThrottleStage;

/// A single sliding-window rate limiter.
pub struct Throttler {
    max_in_interval: usize,
    interval: Duration,
    timestamps: VecDeque<Instant>,
}

impl Throttler {
    #[must_use]
    pub fn new(stage: ThrottleStage) -> Self {
        Self {
            max_in_interval: stage.max_in_interval as usize,
            interval: Duration::from_secs(stage.interval_s),
            timestamps: VecDeque::new(),
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.interval {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns how long the caller must wait before another send is
    /// permitted, or `None` if a send is permitted right now. Does not by
    /// itself record a send — call [`Self::record`] once the wait (if any)
    /// has elapsed and the send actually happens.
    fn wait_duration(&mut self, now: Instant) -> Option<Duration> {
        self.evict_expired(now);
        if self.timestamps.len() < self.max_in_interval {
            return None;
        }
        let oldest = *self.timestamps.front().expect("len checked above");
        let elapsed = now.duration_since(oldest);
        if elapsed >= self.interval {
            None
        } else {
            Some(self.interval - elapsed)
        }
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }
}

/// A series of throttlers applied in order before each publish. Waiting on
/// any stage can be interrupted by setting `stop`, in which case
/// `throttle()` returns early without guaranteeing the window was
/// respected (shutdown takes priority).
pub struct ThrottleChain {
    stages: Vec<Throttler>,
    stop: Arc<AtomicBool>,
}

impl ThrottleChain {
    #[must_use]
    pub fn new(stages: Vec<ThrottleStage>, stop: Arc<AtomicBool>) -> Self {
        Self {
            stages: stages.into_iter().map(Throttler::new).collect(),
            stop,
        }
    }

    /// Blocks (in small interruptible increments) until every stage
    /// permits a send, then records the send against every stage.
    pub fn throttle(&mut self) {
        for stage in &mut self.stages {
            loop {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                let now = Instant::now();
                match stage.wait_duration(now) {
                    None => {
                        stage.record(now);
                        break;
                    }
                    Some(wait) => {
                        std::thread::sleep(wait.min(Duration::from_secs(1)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_max_in_interval_immediately() {
        let mut t = Throttler::new(ThrottleStage {
            max_in_interval: 3,
            interval_s: 60,
        });
        let now = Instant::now();
        for _ in 0..3 {
            assert!(t.wait_duration(now).is_none());
            t.record(now);
        }
        assert!(t.wait_duration(now).is_some());
    }

    #[test]
    fn test_window_expires_after_interval() {
        let mut t = Throttler::new(ThrottleStage {
            max_in_interval: 1,
            interval_s: 0,
        });
        let now = Instant::now();
        t.record(now);
        // interval_s=0 means the window is always already expired
        assert!(t.wait_duration(now + Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_chain_applies_all_stages() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut chain = ThrottleChain::new(
            vec![
                ThrottleStage { max_in_interval: 2, interval_s: 0 },
                ThrottleStage { max_in_interval: 2, interval_s: 0 },
            ],
            stop,
        );
        // interval_s=0 windows always expire, so this should never block
        let start = Instant::now();
        for _ in 0..5 {
            chain.throttle();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_interrupts_wait() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut chain = ThrottleChain::new(
            vec![ThrottleStage { max_in_interval: 1, interval_s: 3600 }],
            Arc::clone(&stop),
        );
        chain.throttle();
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stop2.store(true, Ordering::Relaxed);
        });
        let start = Instant::now();
        chain.throttle();
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}

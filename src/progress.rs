//! Progress pacing: event throttling and transfer speed smoothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rate-limiter for progress events so consumers are not flooded.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// True when enough time has passed since the last emitted event.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Bytes-per-second averaged over a short trailing window.
pub struct SpeedMeter {
    window: Duration,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn bytes_per_sec(&mut self) -> f64 {
        let now = Instant::now();
        self.evict(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, n)| n).sum();
        let span = now
            .duration_since(self.started)
            .min(self.window)
            .max(Duration::from_millis(10));
        bytes as f64 / span.as_secs_f64()
    }

    /// Start a fresh window, e.g. after a pause.
    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.samples.clear();
    }
}

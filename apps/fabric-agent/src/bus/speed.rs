use std::time::Instant;

/// Messages per second between consecutive samples of the processed counter.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    last_count: u64,
    last_at: Instant,
}

impl SpeedMeter {
    pub fn new(count: u64, now: Instant) -> Self {
        Self {
            last_count: count,
            last_at: now,
        }
    }

    pub fn sample(&mut self, count: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        let delta = count.saturating_sub(self.last_count);
        self.last_count = count;
        self.last_at = now;
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        delta as f64 / elapsed
    }
}

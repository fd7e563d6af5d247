//! Rolling CPU percent from cumulative CPU-time readings

use std::time::Instant;

/// Turns a monotonically growing CPU-time total (milliseconds) into a
/// percent-of-one-core figure between samples. The first sample reports 0.
#[derive(Debug, Default)]
pub struct CpuTracker {
    prev: Option<(Instant, f64)>,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&mut self, total_ms: f64) -> f64 {
        let now = Instant::now();
        let pct = match self.prev {
            Some((at, prev_ms)) => {
                let elapsed = now.duration_since(at).as_secs_f64() * 1000.0;
                if elapsed > 0.0 {
                    ((total_ms - prev_ms).max(0.0) / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev = Some((now, total_ms));
        pct
    }
}

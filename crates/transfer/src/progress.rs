use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
                window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut s = self.lock();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples. The first sample marks the
    /// start of the window, so its bytes are not counted.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        self.lock().samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample() {
        let calc = SpeedCalculator::default();
        calc.add_sample(100);
        // Need at least 2 samples.
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_from_timed_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let start = Instant::now();
        calc.add_sample_at(0, start);
        calc.add_sample_at(500, start + Duration::from_millis(500));
        calc.add_sample_at(500, start + Duration::from_secs(1));

        let speed = calc.bytes_per_second();
        assert!((speed - 1000.0).abs() < 1e-6, "speed was {speed}");

        let eta = calc.eta(5000).unwrap();
        assert!((eta.as_secs_f64() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(1)), None);
        let start = Instant::now();
        calc.add_sample_at(1_000_000, start);
        calc.add_sample_at(10, start + Duration::from_secs(5));
        // The first sample fell out, leaving one.
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn reset_clears_samples() {
        let calc = SpeedCalculator::default();
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn max_samples_is_enforced() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.lock().samples.len() <= 5);
    }

    #[test]
    fn concurrent_access() {
        use std::thread;

        let calc = Arc::new(SpeedCalculator::default());
        let mut handles = vec![];

        for _ in 0..10 {
            let c = Arc::clone(&calc);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    c.add_sample(1);
                    let _ = c.bytes_per_second();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let _ = calc.bytes_per_second();
    }
}

//! Histograms for latency distributions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default buckets (seconds) for request latency.
pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Buckets (seconds) for whole migrations.
pub const MIGRATION_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
];

#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    /// f64 bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(name, help, REQUEST_LATENCY_BUCKETS.to_vec())
    }

    pub fn with_buckets(name: &'static str, help: &'static str, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            help,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Start a timer that observes when dropped.
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Observes the elapsed time into its histogram when dropped.
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl HistogramTimer<'_> {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}

#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    /// Cumulative: observations <= each bucket boundary.
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Approximate percentile by linear interpolation within buckets.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let target = (self.count as f64 * p / 100.0).ceil() as u64;
        let mut prev_count = 0;
        let mut prev_bound = 0.0;

        for (i, &count) in self.bucket_counts.iter().enumerate() {
            if count >= target {
                let in_bucket = count - prev_count;
                if in_bucket == 0 {
                    return self.buckets[i];
                }
                let position = (target - prev_count) as f64 / in_bucket as f64;
                return prev_bound + position * (self.buckets[i] - prev_bound);
            }
            prev_count = count;
            prev_bound = self.buckets[i];
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_mean() {
        let hist = Histogram::new("latency", "Request latency");
        hist.observe(0.002);
        hist.observe(0.004);

        let snap = hist.snapshot();
        assert_eq!(snap.count, 2);
        assert!((snap.mean() - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_timer_observes_on_drop() {
        let hist = Histogram::new("latency", "Request latency");
        {
            let _timer = hist.start_timer();
            std::thread::sleep(Duration::from_millis(5));
        }
        let snap = hist.snapshot();
        assert_eq!(snap.count, 1);
        assert!(snap.sum >= 0.005);
    }

    #[test]
    fn test_percentile() {
        let hist = Histogram::with_buckets("p", "Percentile", vec![10.0, 50.0, 100.0]);
        for i in 1..=100 {
            hist.observe(i as f64);
        }

        let snap = hist.snapshot();
        let p50 = snap.percentile(50.0);
        assert!(p50 > 40.0 && p50 <= 50.0);
        assert!(snap.percentile(99.0) > 90.0);
    }
}

//! Benchmark progress display and timing statistics.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar for repeated exchanges
pub struct BenchProgress {
    bar: ProgressBar,
}

impl BenchProgress {
    /// Create a progress bar for `iterations` exchanges with `peer`
    #[must_use]
    pub fn new(iterations: u64, peer: &str) -> Self {
        let bar = ProgressBar::new(iterations);

        match ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta})")
        {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => tracing::debug!("Falling back to default progress style: {}", e),
        }

        bar.set_message(format!("Exchanging with {peer}"));

        Self { bar }
    }

    /// Record one finished exchange
    pub fn tick(&self, failures: u64) {
        self.bar.inc(1);
        if failures > 0 {
            self.bar.set_message(format!("{failures} failed so far"));
        }
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Summary statistics over exchange durations, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    /// Number of samples
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Median
    pub median: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// Fastest sample
    pub min: f64,
    /// Slowest sample
    pub max: f64,
    /// Coefficient of variation in percent
    pub cv_percent: f64,
}

impl TimingStats {
    /// Summarize `samples`; `None` if there are none
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_durations(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        millis.sort_by(f64::total_cmp);

        let count = millis.len();
        let mean = millis.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (millis[count / 2 - 1] + millis[count / 2]) / 2.0
        } else {
            millis[count / 2]
        };
        let variance = millis.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / count as f64;
        let std_dev = variance.sqrt();
        let cv_percent = if mean > 0.0 { std_dev / mean * 100.0 } else { 0.0 };

        Some(Self {
            count,
            mean,
            median,
            std_dev,
            min: millis[0],
            max: millis[count - 1],
            cv_percent,
        })
    }
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_secs_f64() * 1000.0;
    if millis < 1000.0 {
        format!("{millis:.2} ms")
    } else {
        format!("{:.2} s", millis / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_empty() {
        assert!(TimingStats::from_durations(&[]).is_none());
    }

    #[test]
    fn test_stats() {
        let samples = [10, 20, 30, 40].map(Duration::from_millis);
        let stats = TimingStats::from_durations(&samples).unwrap();

        assert_eq!(stats.count, 4);
        assert!((stats.mean - 25.0).abs() < 1e-9);
        assert!((stats.median - 25.0).abs() < 1e-9);
        assert!((stats.min - 10.0).abs() < 1e-9);
        assert!((stats.max - 40.0).abs() < 1e-9);
        // population std of 10,20,30,40 is sqrt(125)
        assert!((stats.std_dev - 125f64.sqrt()).abs() < 1e-9);
        assert!((stats.cv_percent - 125f64.sqrt() / 25.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_odd_median() {
        let samples = [5, 1, 3].map(Duration::from_millis);
        let stats = TimingStats::from_durations(&samples).unwrap();
        assert!((stats.median - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(12)), "12.00 ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50 s");
    }
}

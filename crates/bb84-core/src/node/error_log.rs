//! Bounded history of observed check-bit error rates

use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Ring buffer of mismatch fractions recorded by the responder's check step
///
/// Once `capacity` samples are held, each new sample evicts the oldest.
#[derive(Debug)]
pub struct ErrorRateLog {
    capacity: usize,
    samples: RwLock<VecDeque<f64>>,
}

impl ErrorRateLog {
    /// Create an empty log holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Append one observation
    pub async fn record(&self, rate: f64) {
        let mut samples = self.samples.write().await;
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(rate);
    }

    /// Copy of every retained observation, oldest first
    pub async fn snapshot(&self) -> Vec<f64> {
        self.samples.read().await.iter().copied().collect()
    }

    /// Mean of the retained observations (0.0 when empty)
    #[allow(clippy::cast_precision_loss)]
    pub async fn average(&self) -> f64 {
        let samples = self.samples.read().await;
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Number of retained observations
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    /// True if nothing has been recorded
    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }

    /// Maximum number of retained observations
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

use std::collections::VecDeque;

use dashmap::DashMap;

/// Last `size` request outcomes per channel.
#[derive(Debug)]
pub struct MetricWindow {
    size: usize,
    threshold: f64,
    outcomes: DashMap<i64, VecDeque<bool>>,
}

impl MetricWindow {
    pub fn new(size: usize, threshold: f64) -> Self {
        Self {
            size: size.max(1),
            threshold,
            outcomes: DashMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Records one outcome. When the window is full and its success rate is
    /// below the threshold, the window is reset and the rate returned.
    pub fn record(&self, channel_id: i64, success: bool) -> Option<f64> {
        let mut window = self.outcomes.entry(channel_id).or_default();
        window.push_back(success);
        while window.len() > self.size {
            window.pop_front();
        }
        if window.len() < self.size {
            return None;
        }
        let successes = window.iter().filter(|ok| **ok).count();
        let rate = successes as f64 / self.size as f64;
        if rate < self.threshold {
            window.clear();
            Some(rate)
        } else {
            None
        }
    }

    pub fn reset(&self, channel_id: i64) {
        self.outcomes.remove(&channel_id);
    }
}

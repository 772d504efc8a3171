//! Per-model preview latency tracking: a bounded ring buffer of recent
//! samples plus a p95 query, safe for concurrent record/read.

use std::sync::RwLock;

use dashmap::DashMap;

use crate::query::ModelId;

/// Percentile summary over a window of latency samples, in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub samples: usize,
}

impl LatencyStats {
    /// `sorted` must already be sorted ascending.
    fn from_sorted(sorted: &[f64]) -> Self {
        if sorted.is_empty() {
            return LatencyStats::default();
        }
        let idx = |q: f64| -> usize {
            let i = (sorted.len() as f64 * q) as usize;
            i.min(sorted.len() - 1)
        };
        LatencyStats {
            p50: sorted[idx(0.50)],
            p95: sorted[idx(0.95)],
            p99: sorted[idx(0.99)],
            max: *sorted.last().unwrap(),
            samples: sorted.len(),
        }
    }
}

struct Window {
    samples: RwLock<Vec<f64>>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Window {
            samples: RwLock::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn record(&self, latency_seconds: f64) {
        let mut guard = self.samples.write().expect("latency window lock poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
        }
        guard.push(latency_seconds);
    }

    fn stats(&self) -> LatencyStats {
        let guard = self.samples.read().expect("latency window lock poisoned");
        let mut sorted = guard.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        LatencyStats::from_sorted(&sorted)
    }
}

/// Tracks preview latency per candidate model.
pub struct LatencyMetrics {
    windows: DashMap<ModelId, Window>,
    capacity: usize,
}

impl LatencyMetrics {
    pub fn new(capacity: usize) -> Self {
        LatencyMetrics {
            windows: DashMap::new(),
            capacity,
        }
    }

    pub fn record(&self, model: &ModelId, latency_seconds: f64) {
        self.windows
            .entry(model.clone())
            .or_insert_with(|| Window::new(self.capacity))
            .record(latency_seconds);
    }

    pub fn stats(&self, model: &ModelId) -> LatencyStats {
        self.windows
            .get(model)
            .map(|w| w.stats())
            .unwrap_or_default()
    }

    pub fn p95(&self, model: &ModelId) -> f64 {
        self.stats(model).p95
    }

    /// `p95(model) / reference`, clamped to `[0, 1]`; 0 when no samples yet.
    pub fn p95_norm(&self, model: &ModelId, reference_latency_secs: f64) -> f64 {
        if reference_latency_secs <= 0.0 {
            return 0.0;
        }
        (self.p95(model) / reference_latency_secs).clamp(0.0, 1.0)
    }

    pub fn snapshot(&self) -> Vec<(ModelId, LatencyStats)> {
        self.windows
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_zero_stats() {
        let m = LatencyMetrics::new(8);
        let id = ModelId::new("a");
        assert_eq!(m.p95(&id), 0.0);
    }

    #[test]
    fn p95_over_known_samples() {
        let m = LatencyMetrics::new(100);
        let id = ModelId::new("a");
        for i in 1..=100 {
            m.record(&id, i as f64);
        }
        // 95th percentile index of 100 ascending 1..=100 samples.
        let stats = m.stats(&id);
        assert_eq!(stats.samples, 100);
        assert!(stats.p95 >= 95.0 && stats.p95 <= 96.0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let m = LatencyMetrics::new(3);
        let id = ModelId::new("a");
        m.record(&id, 1.0);
        m.record(&id, 2.0);
        m.record(&id, 3.0);
        m.record(&id, 4.0);
        let stats = m.stats(&id);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.max, 4.0);
    }

    #[test]
    fn p95_norm_clamped_to_one() {
        let m = LatencyMetrics::new(8);
        let id = ModelId::new("a");
        m.record(&id, 100.0);
        assert_eq!(m.p95_norm(&id, 1.0), 1.0);
    }
}

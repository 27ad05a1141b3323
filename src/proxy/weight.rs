use std::time::Duration;

/// Weight never drops below this, so `load / weight` stays finite.
pub const MIN_WEIGHT: f64 = 1e-3;

const MIN_ELAPSED_SECS: f64 = 1e-3;

/// Recomputes a mirror's weight when a request to it completes.
pub trait WeightPolicy: Send + Sync {
    fn weight(&self, load: usize, elapsed: Duration, bytes: u64) -> f64;
}

/// `beta * load + (1 - beta) * throughput / k`, with `k` picked from the
/// throughput tier so the second term stays comparable to the first.
#[derive(Clone, Copy, Debug)]
pub struct DynamicWeight {
    pub beta: f64,
}

impl Default for DynamicWeight {
    fn default() -> Self {
        Self { beta: 0.7 }
    }
}

impl DynamicWeight {
    pub fn normalizer(throughput: f64) -> f64 {
        if throughput > 1e9 {
            1e3
        } else if throughput > 1e6 {
            1e5
        } else {
            1e6
        }
    }
}

impl WeightPolicy for DynamicWeight {
    fn weight(&self, load: usize, elapsed: Duration, bytes: u64) -> f64 {
        let secs = elapsed.as_secs_f64().max(MIN_ELAPSED_SECS);
        let throughput = bytes as f64 / secs;
        let k = Self::normalizer(throughput);
        let weight = self.beta * load as f64 + (1.0 - self.beta) * (throughput / k);
        if weight.is_finite() {
            weight.max(MIN_WEIGHT)
        } else {
            MIN_WEIGHT
        }
    }
}

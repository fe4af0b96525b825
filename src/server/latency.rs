use crate::config::LatencyConfig;
use crate::simulator::DeterministicRng;
use std::time::Duration;

/// Samples simulated service and cancellation-propagation delays.
pub struct LatencyModel {
    config: LatencyConfig,
    rng: DeterministicRng,
}

impl LatencyModel {
    pub fn new(config: LatencyConfig, rng: DeterministicRng) -> Self {
        LatencyModel { config, rng }
    }

    pub fn work_delay(&mut self) -> Duration {
        let (min, max) = (self.config.work_min, self.config.work_max);
        self.sample(min, max)
    }

    pub fn cancel_delay(&mut self) -> Duration {
        let (min, max) = (self.config.cancel_min, self.config.cancel_max);
        self.sample(min, max)
    }

    fn sample(&mut self, min: Duration, max: Duration) -> Duration {
        let micros = self
            .rng
            .gen_range_inclusive(min.as_micros() as u64, max.as_micros() as u64);
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_within_bounds() {
        let config = LatencyConfig {
            work_min: Duration::from_millis(2),
            work_max: Duration::from_millis(8),
            cancel_min: Duration::from_millis(1),
            cancel_max: Duration::from_millis(3),
        };
        let mut model = LatencyModel::new(config.clone(), DeterministicRng::new(5));
        for _ in 0..200 {
            let work = model.work_delay();
            assert!(work >= config.work_min && work <= config.work_max);
            let cancel = model.cancel_delay();
            assert!(cancel >= config.cancel_min && cancel <= config.cancel_max);
        }
    }

    #[test]
    fn test_fixed_latency() {
        let config = LatencyConfig::fixed(Duration::from_millis(10), Duration::from_millis(4));
        let mut model = LatencyModel::new(config, DeterministicRng::new(0));
        assert_eq!(model.work_delay(), Duration::from_millis(10));
        assert_eq!(model.cancel_delay(), Duration::from_millis(4));
    }
}

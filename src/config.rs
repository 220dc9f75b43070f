use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SensorError};
use crate::models::domain::FEATURE_DIM;

pub const DEFAULT_PORT_WHITELIST: [u16; 4] = [80, 443, 53, 22];

/// How the reconstruction-error threshold is derived from the baseline fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "params", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Largest baseline reconstruction error times `margin`.
    MaxBaselineMargin { margin: f64 },
    /// Nearest-rank percentile of baseline errors times `margin`.
    Percentile { percentile: f64, margin: f64 },
    /// Use this value as is.
    Fixed(f64),
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::MaxBaselineMargin { margin: 1.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Aggregation window length.
    pub window: Duration,
    /// Number of principal directions kept by the model.
    pub rank: usize,
    pub threshold: ThresholdPolicy,
    /// Destination ports whose bytes do not count as unusual.
    pub port_whitelist: Vec<u16>,
    /// Weight kept by the running averages on every window (new value gets `1 - smoothing`).
    pub smoothing: f64,
    pub read_timeout_ms: i32,
    pub snaplen: i32,
    pub baseline_samples: usize,
    pub baseline_seed: u64,
    /// Per-subscriber event buffer; events beyond it are dropped for that subscriber.
    pub subscriber_capacity: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            window: Duration::from_secs(1),
            rank: 3,
            threshold: ThresholdPolicy::default(),
            port_whitelist: DEFAULT_PORT_WHITELIST.to_vec(),
            smoothing: 0.9,
            read_timeout_ms: 1000,
            snaplen: 65535,
            baseline_samples: 60,
            baseline_seed: 42,
            subscriber_capacity: 1024,
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(invalid("aggregation window must be non-zero"));
        }
        if self.rank == 0 || self.rank > FEATURE_DIM {
            return Err(invalid(format!(
                "model rank must be within 1..={FEATURE_DIM}, got {}",
                self.rank
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(invalid(format!(
                "smoothing factor must be within [0, 1), got {}",
                self.smoothing
            )));
        }
        if self.read_timeout_ms <= 0 {
            return Err(invalid("read timeout must be positive"));
        }
        if self.baseline_samples < 2 {
            return Err(invalid("baseline needs at least two samples"));
        }
        if self.subscriber_capacity == 0 {
            return Err(invalid("subscriber capacity must be non-zero"));
        }
        match self.threshold {
            ThresholdPolicy::MaxBaselineMargin { margin } if margin <= 0.0 => {
                Err(invalid("threshold margin must be positive"))
            }
            ThresholdPolicy::Percentile { percentile, margin }
                if percentile <= 0.0 || percentile > 100.0 || margin <= 0.0 =>
            {
                Err(invalid(format!(
                    "percentile must be within (0, 100] and margin positive, got {percentile}/{margin}"
                )))
            }
            ThresholdPolicy::Fixed(t) if !t.is_finite() || t < 0.0 => {
                Err(invalid("fixed threshold must be finite and non-negative"))
            }
            _ => Ok(()),
        }
    }
}

fn invalid(msg: impl Into<String>) -> SensorError {
    SensorError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SensorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window, Duration::from_secs(1));
        assert_eq!(config.rank, 3);
        assert_eq!(config.port_whitelist, vec![80, 443, 53, 22]);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = SensorConfig {
            rank: 6,
            ..SensorConfig::default()
        };
        assert!(matches!(config.validate(), Err(SensorError::InvalidConfig(_))));

        config.rank = 3;
        config.smoothing = 1.0;
        assert!(config.validate().is_err());

        config.smoothing = 0.9;
        config.threshold = ThresholdPolicy::Percentile {
            percentile: 0.0,
            margin: 1.0,
        };
        assert!(config.validate().is_err());

        config.threshold = ThresholdPolicy::Fixed(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SensorConfig = serde_json::from_str(r#"{"rank": 2}"#).unwrap();
        assert_eq!(config.rank, 2);
        assert_eq!(config.smoothing, 0.9);
        assert_eq!(config.threshold, ThresholdPolicy::default());
    }

    #[test]
    fn threshold_policy_from_json() {
        let fixed: ThresholdPolicy =
            serde_json::from_str(r#"{"policy": "fixed", "params": 4.5}"#).unwrap();
        assert_eq!(fixed, ThresholdPolicy::Fixed(4.5));

        let json = serde_json::to_value(ThresholdPolicy::Percentile {
            percentile: 95.0,
            margin: 1.2,
        })
        .unwrap();
        assert_eq!(json["policy"], "percentile");
        assert_eq!(json["params"]["percentile"], 95.0);
    }
}

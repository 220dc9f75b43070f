//! Rank-limited PCA novelty detector over the fixed five-feature schema.
//!
//! Training centres a baseline of "normal" windows, takes the top-k
//! eigenvectors of its covariance and calibrates a threshold on the
//! baseline's own reconstruction errors. Scoring projects a window onto that
//! subspace and back; the norm of what is left over is the anomaly score.
//!
//! The model is immutable once trained, so a shared reference can score
//! from any number of threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::{SensorConfig, ThresholdPolicy};
use crate::error::{Result, SensorError};
use crate::models::domain::{FeatureVector, FEATURE_DIM};

type Vector = [f64; FEATURE_DIM];
type Matrix = [[f64; FEATURE_DIM]; FEATURE_DIM];

const JACOBI_MAX_SWEEPS: usize = 64;
const JACOBI_TOLERANCE: f64 = 1e-12;

/// Lower bound for a calibrated threshold so that a baseline lying entirely
/// inside the subspace does not flag rounding noise.
const MIN_THRESHOLD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub is_anomaly: bool,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyModel {
    mean: Vector,
    /// Orthonormal principal directions, largest variance first.
    basis: Vec<Vector>,
    /// Variance captured by each direction in `basis`.
    eigenvalues: Vec<f64>,
    threshold: f64,
}

impl AnomalyModel {
    /// Fit the model to `baseline` keeping `rank` principal directions.
    pub fn train(baseline: &[FeatureVector], rank: usize, policy: ThresholdPolicy) -> Result<Self> {
        if baseline.len() < 2 {
            return Err(SensorError::Training(format!(
                "need at least 2 baseline samples, got {}",
                baseline.len()
            )));
        }
        if rank == 0 || rank > FEATURE_DIM {
            return Err(SensorError::Training(format!(
                "rank must be within 1..={FEATURE_DIM}, got {rank}"
            )));
        }

        let samples: Vec<Vector> = baseline.iter().map(FeatureVector::to_array).collect();
        if samples.iter().flatten().any(|v| !v.is_finite()) {
            return Err(SensorError::Training("baseline contains non-finite values".into()));
        }

        let mean = mean(&samples);
        let cov = covariance(&samples, &mean);
        let (values, vectors) = symmetric_eigen(cov);

        let mut order: Vec<usize> = (0..FEATURE_DIM).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

        let basis: Vec<Vector> = order[..rank]
            .iter()
            .map(|&col| std::array::from_fn(|row| vectors[row][col]))
            .collect();
        let eigenvalues = order[..rank].iter().map(|&col| values[col].max(0.0)).collect();

        let mut model = AnomalyModel {
            mean,
            basis,
            eigenvalues,
            threshold: f64::INFINITY,
        };
        let errors: Vec<f64> = samples.iter().map(|s| model.residual_norm(s)).collect();
        model.threshold = calibrate(&errors, policy);

        tracing::info!(
            rank,
            samples = samples.len(),
            threshold = model.threshold,
            "anomaly model trained"
        );
        Ok(model)
    }

    /// Train on the seeded synthetic baseline described by `config`.
    pub fn bootstrap(config: &SensorConfig) -> Result<Self> {
        let baseline = synthetic_baseline(config.baseline_samples, config.baseline_seed);
        AnomalyModel::train(&baseline, config.rank, config.threshold)
    }

    pub fn score(&self, features: &FeatureVector) -> Prediction {
        let score = self.reconstruction_error(features);
        Prediction {
            // NaN never compares greater, so a poisoned window is not flagged
            is_anomaly: score > self.threshold,
            score,
        }
    }

    pub fn reconstruction_error(&self, features: &FeatureVector) -> f64 {
        self.residual_norm(&features.to_array())
    }

    fn residual_norm(&self, x: &Vector) -> f64 {
        let mut residual: Vector = std::array::from_fn(|i| x[i] - self.mean[i]);
        let centered = residual;
        for direction in &self.basis {
            let weight = dot(&centered, direction);
            for (r, d) in residual.iter_mut().zip(direction) {
                *r -= weight * d;
            }
        }
        dot(&residual, &residual).sqrt()
    }

    pub fn mean(&self) -> FeatureVector {
        FeatureVector::from_array(self.mean)
    }

    pub fn basis(&self) -> &[Vector] {
        &self.basis
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn rank(&self) -> usize {
        self.basis.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Seeded stand-in for a recorded quiet period: about 1.0-1.5 kB/s over
/// 10-15 packets, 2-4 peers, a little unusual-port traffic and a roughly
/// balanced outbound ratio.
pub fn synthetic_baseline(samples: usize, seed: u64) -> Vec<FeatureVector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..samples)
        .map(|_| FeatureVector {
            bytes_per_sec: rng.gen_range(1000.0..1500.0),
            packets_per_sec: rng.gen_range(10.0..15.0),
            unique_ips: rng.gen_range(2.0..4.0),
            unusual_port_bytes: rng.gen_range(0.0..50.0),
            outbound_ratio: rng.gen_range(1.0..1.5),
        })
        .collect()
}

fn calibrate(errors: &[f64], policy: ThresholdPolicy) -> f64 {
    let threshold = match policy {
        ThresholdPolicy::Fixed(t) => return t,
        ThresholdPolicy::MaxBaselineMargin { margin } => {
            errors.iter().copied().fold(0.0, f64::max) * margin
        }
        ThresholdPolicy::Percentile { percentile, margin } => {
            let mut sorted = errors.to_vec();
            sorted.sort_by(f64::total_cmp);
            let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1] * margin
        }
    };
    threshold.max(MIN_THRESHOLD)
}

fn mean(samples: &[Vector]) -> Vector {
    let n = samples.len() as f64;
    std::array::from_fn(|i| samples.iter().map(|s| s[i]).sum::<f64>() / n)
}

/// Sample covariance (n - 1 denominator).
fn covariance(samples: &[Vector], mean: &Vector) -> Matrix {
    let mut cov = [[0.0; FEATURE_DIM]; FEATURE_DIM];
    for s in samples {
        for i in 0..FEATURE_DIM {
            for j in i..FEATURE_DIM {
                cov[i][j] += (s[i] - mean[i]) * (s[j] - mean[j]);
            }
        }
    }
    let denom = (samples.len() - 1) as f64;
    for i in 0..FEATURE_DIM {
        for j in i..FEATURE_DIM {
            cov[i][j] /= denom;
            cov[j][i] = cov[i][j];
        }
    }
    cov
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
/// Returns eigenvalues and a matrix whose columns are the matching unit eigenvectors.
fn symmetric_eigen(mut a: Matrix) -> (Vector, Matrix) {
    let n = FEATURE_DIM;
    let mut v = [[0.0; FEATURE_DIM]; FEATURE_DIM];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p][q] * a[p][q])
            .sum();
        let scale: f64 = (0..n).map(|i| a[i][i] * a[i][i]).sum::<f64>().max(f64::MIN_POSITIVE);
        if off <= JACOBI_TOLERANCE * JACOBI_TOLERANCE * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p][q];
                if apq.abs() <= f64::EPSILON * (a[p][p].abs() + a[q][q].abs()) {
                    a[p][q] = 0.0;
                    a[q][p] = 0.0;
                    continue;
                }

                let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let (akp, akq) = (a[k][p], a[k][q]);
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[p][k], a[q][k]);
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let (vkp, vkq) = (row[p], row[q]);
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    (std::array::from_fn(|i| a[i][i]), v)
}

fn dot(a: &Vector, b: &Vector) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

use crate::types::{CalibrationData, ImuSample};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Samples required per sensor before a session can finish.
pub const CALIBRATION_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("Not enough samples for calibration (accel {accel}, gyro {gyro}, need {required})")]
    InsufficientSamples {
        accel: usize,
        gyro: usize,
        required: usize,
    },
    #[error("Calibration statistics produced non-finite or singular corrections")]
    Degenerate,
    #[error("Calibration data rejected: values must be finite and scale matrices invertible")]
    InvalidData,
}

/// Stationary-calibration tuning.
///
/// The noise gains inflate each axis scale by `1 + gain * variance`. They are
/// empirical; different sensors have shipped with 0.5 and 0.01.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Gravity magnitude assumed along +z while stationary (m/s^2).
    pub gravity: f64,
    pub accel_noise_gain: f64,
    pub gyro_noise_gain: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            accel_noise_gain: 0.5,
            gyro_noise_gain: 0.5,
        }
    }
}

enum CalibrationState {
    Idle,
    Collecting {
        accel: VecDeque<Vector3<f64>>,
        gyro: VecDeque<Vector3<f64>>,
    },
}

/// Collects a stationary session and turns it into bias + scale corrections.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    state: CalibrationState,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Idle,
        }
    }

    /// Begin a new session, discarding anything collected so far.
    pub fn start(&mut self) {
        self.state = CalibrationState::Collecting {
            accel: VecDeque::with_capacity(CALIBRATION_SAMPLES),
            gyro: VecDeque::with_capacity(CALIBRATION_SAMPLES),
        };
    }

    /// Abandon the current session, if any.
    pub fn cancel(&mut self) {
        self.state = CalibrationState::Idle;
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, CalibrationState::Collecting { .. })
    }

    /// Buffered (accel, gyro) sample counts.
    pub fn buffered(&self) -> (usize, usize) {
        match &self.state {
            CalibrationState::Idle => (0, 0),
            CalibrationState::Collecting { accel, gyro } => (accel.len(), gyro.len()),
        }
    }

    /// Buffer one sample. Ignored unless a session is running; the oldest
    /// sample is evicted once the buffers are full.
    pub fn push(&mut self, sample: &ImuSample) {
        let CalibrationState::Collecting { accel, gyro } = &mut self.state else {
            return;
        };

        accel.push_back(sample.accel);
        gyro.push_back(sample.gyro);
        while accel.len() > CALIBRATION_SAMPLES {
            accel.pop_front();
        }
        while gyro.len() > CALIBRATION_SAMPLES {
            gyro.pop_front();
        }
    }

    /// Compute corrections from the buffered session.
    ///
    /// With too few samples the session keeps collecting. Any other outcome
    /// ends the session.
    pub fn finish(&mut self) -> Result<CalibrationData, CalibrationError> {
        let (accel, gyro) = match std::mem::replace(&mut self.state, CalibrationState::Idle) {
            CalibrationState::Collecting { accel, gyro }
                if accel.len() >= CALIBRATION_SAMPLES && gyro.len() >= CALIBRATION_SAMPLES =>
            {
                (accel, gyro)
            }
            unfinished => {
                self.state = unfinished;
                let (accel, gyro) = self.buffered();
                return Err(CalibrationError::InsufficientSamples {
                    accel,
                    gyro,
                    required: CALIBRATION_SAMPLES,
                });
            }
        };

        let (accel_mean, accel_cov) = mean_and_covariance(&accel);
        let (gyro_mean, gyro_cov) = mean_and_covariance(&gyro);

        let data = CalibrationData {
            // Stationary and z-up: the only true acceleration is gravity.
            accel_bias: accel_mean - Vector3::new(0.0, 0.0, self.config.gravity),
            accel_scale: noise_inflated_scale(&accel_cov, self.config.accel_noise_gain),
            // Stationary: the true rate is zero.
            gyro_bias: gyro_mean,
            gyro_scale: noise_inflated_scale(&gyro_cov, self.config.gyro_noise_gain),
        };

        if !data.is_usable() {
            return Err(CalibrationError::Degenerate);
        }

        tracing::info!(
            accel_bias = ?data.accel_bias.as_slice(),
            gyro_bias = ?data.gyro_bias.as_slice(),
            "IMU calibration complete"
        );
        Ok(data)
    }
}

/// Sample mean and (N-1)-normalized covariance.
fn mean_and_covariance(samples: &VecDeque<Vector3<f64>>) -> (Vector3<f64>, Matrix3<f64>) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<Vector3<f64>>() / n;

    let scatter = samples
        .iter()
        .map(|s| {
            let d = s - mean;
            d * d.transpose()
        })
        .sum::<Matrix3<f64>>();

    (mean, scatter / (n - 1.0))
}

fn noise_inflated_scale(covariance: &Matrix3<f64>, gain: f64) -> Matrix3<f64> {
    let diag = Vector3::repeat(1.0) + covariance.diagonal() * gain;
    Matrix3::from_diagonal(&diag)
}

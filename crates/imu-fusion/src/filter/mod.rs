//! Orientation filters.
//!
//! Every filter fuses one corrected accelerometer + gyroscope pair per call
//! into a unit quaternion. Updates are computed on a copy of the filter state
//! and committed only on success; a failed update leaves the filter untouched.

mod complementary;
mod kalman;
mod madgwick;

pub use complementary::ComplementaryFilter;
pub use kalman::KalmanFilter;
pub use madgwick::MadgwickFilter;

use nalgebra::{Matrix3, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("Unknown filter type '{0}' (expected complementary, madgwick or kalman)")]
    UnknownFilterType(String),
    #[error("Invalid filter parameter {name} = {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("Accelerometer vector is zero or non-finite")]
    DegenerateAcceleration,
    #[error("Innovation covariance is not invertible")]
    SingularInnovation,
    #[error("Filter update produced a non-finite orientation")]
    NonFinite,
}

/// Stateful orientation estimator.
pub trait OrientationFilter: Send {
    /// Fuse one accelerometer (m/s^2) + gyroscope (rad/s) pair, `dt` seconds
    /// after the previous one.
    fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<(), FilterError>;

    /// Current orientation estimate.
    fn orientation(&self) -> UnitQuaternion<f64>;

    /// Return to the identity orientation and drop any auxiliary state.
    fn reset(&mut self);
}

/// Selector for the available filter implementations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Complementary,
    Madgwick,
    #[default]
    Kalman,
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complementary => "complementary",
            Self::Madgwick => "madgwick",
            Self::Kalman => "kalman",
        };
        f.write_str(name)
    }
}

impl FromStr for FilterType {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complementary" => Ok(Self::Complementary),
            "madgwick" => Ok(Self::Madgwick),
            "kalman" => Ok(Self::Kalman),
            _ => Err(FilterError::UnknownFilterType(s.to_string())),
        }
    }
}

/// Tuning shared by the factory. Only the field matching the selected filter
/// is used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Complementary filter blend toward the accelerometer, in (0, 1).
    pub accel_weight: f64,
    /// Madgwick gradient step gain. Higher = faster convergence, more noise.
    pub madgwick_beta: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            accel_weight: ComplementaryFilter::DEFAULT_ACCEL_WEIGHT,
            madgwick_beta: MadgwickFilter::DEFAULT_BETA,
        }
    }
}

/// Build a fresh filter of the requested type.
pub fn create_filter(
    kind: FilterType,
    params: &FilterParams,
) -> Result<Box<dyn OrientationFilter>, FilterError> {
    match kind {
        FilterType::Complementary => {
            let w = params.accel_weight;
            if !(w.is_finite() && w > 0.0 && w < 1.0) {
                return Err(FilterError::InvalidParameter {
                    name: "accel_weight",
                    value: w,
                });
            }
            Ok(Box::new(ComplementaryFilter::new(w)))
        }
        FilterType::Madgwick => {
            let beta = params.madgwick_beta;
            if !(beta.is_finite() && beta > 0.0) {
                return Err(FilterError::InvalidParameter {
                    name: "madgwick_beta",
                    value: beta,
                });
            }
            Ok(Box::new(MadgwickFilter::new(beta)))
        }
        FilterType::Kalman => Ok(Box::new(KalmanFilter::new())),
    }
}

/// Rotation of `rotation.norm()` radians about `rotation`, or identity when
/// the angle does not exceed `min_angle`.
pub(crate) fn delta_rotation(rotation: &Vector3<f64>, min_angle: f64) -> UnitQuaternion<f64> {
    let angle = rotation.norm();
    if angle > min_angle {
        let axis = Unit::new_unchecked(rotation / angle);
        UnitQuaternion::from_axis_angle(&axis, angle)
    } else {
        UnitQuaternion::identity()
    }
}

/// Cross-product matrix: `skew(v) * u == v.cross(u)`.
pub(crate) fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Shortest-arc interpolation, `t = 0` gives `from`.
pub fn slerp(from: &UnitQuaternion<f64>, to: &UnitQuaternion<f64>, t: f64) -> UnitQuaternion<f64> {
    from.try_slerp(to, t, 1e-12)
        .unwrap_or_else(|| from.nlerp(to, t))
}

/// Normalized accelerometer direction, rejecting zero and non-finite input.
pub(crate) fn gravity_direction(accel: &Vector3<f64>) -> Result<Vector3<f64>, FilterError> {
    let norm = accel.norm();
    if !norm.is_finite() || norm < f64::EPSILON {
        return Err(FilterError::DegenerateAcceleration);
    }
    Ok(accel / norm)
}

pub(crate) fn is_finite_quaternion(q: &UnitQuaternion<f64>) -> bool {
    q.coords.iter().all(|v| v.is_finite())
}

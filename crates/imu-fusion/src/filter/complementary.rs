use super::{
    delta_rotation, gravity_direction, is_finite_quaternion, slerp, FilterError, OrientationFilter,
};
use nalgebra::{UnitQuaternion, Vector3};
use std::f64::consts::PI;

/// Rotations smaller than this are treated as no rotation.
const MIN_ROTATION: f64 = 1e-10;

/// Gyro integration blended toward the accelerometer tilt.
///
/// The gyro-propagated orientation is slerped toward the orientation implied
/// by gravity alone, by `accel_weight` per update.
pub struct ComplementaryFilter {
    accel_weight: f64,
    orientation: UnitQuaternion<f64>,
}

impl ComplementaryFilter {
    pub const DEFAULT_ACCEL_WEIGHT: f64 = 0.02;

    pub fn new(accel_weight: f64) -> Self {
        Self {
            accel_weight,
            orientation: UnitQuaternion::identity(),
        }
    }

    pub fn accel_weight(&self) -> f64 {
        self.accel_weight
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ACCEL_WEIGHT)
    }
}

/// Rotation taking world up onto the measured gravity direction.
fn accel_orientation(up: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::rotation_between(&Vector3::z(), up)
        // Upside down: any half turn about a horizontal axis will do.
        .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI))
}

impl OrientationFilter for ComplementaryFilter {
    fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<(), FilterError> {
        let up = gravity_direction(accel)?;

        let gyro_estimate = self.orientation * delta_rotation(&(gyro * dt), MIN_ROTATION);
        let accel_estimate = accel_orientation(&up);

        let mut blended = slerp(&gyro_estimate, &accel_estimate, self.accel_weight);
        blended.renormalize();

        if !is_finite_quaternion(&blended) {
            return Err(FilterError::NonFinite);
        }
        self.orientation = blended;
        Ok(())
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    fn reset(&mut self) {
        self.orientation = UnitQuaternion::identity();
    }
}

use super::{gravity_direction, FilterError, OrientationFilter};
use nalgebra::{Quaternion, UnitQuaternion, Vector3, Vector4};

/// Steps smaller than this are left unnormalized.
const MIN_STEP: f64 = 1e-10;

/// Madgwick gradient-descent filter, IMU-only (no magnetometer).
///
/// Each update takes one normalized gradient step of size `beta` toward the
/// orientation that aligns predicted gravity with the accelerometer, on top
/// of the gyro-driven quaternion derivative.
pub struct MadgwickFilter {
    /// Quaternion [w, x, y, z].
    q: Vector4<f64>,
    /// Algorithm gain.
    beta: f64,
}

impl MadgwickFilter {
    pub const DEFAULT_BETA: f64 = 0.1;

    pub fn new(beta: f64) -> Self {
        Self {
            q: Vector4::new(1.0, 0.0, 0.0, 0.0),
            beta,
        }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl Default for MadgwickFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BETA)
    }
}

impl OrientationFilter for MadgwickFilter {
    fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<(), FilterError> {
        let [ax, ay, az]: [f64; 3] = gravity_direction(accel)?.into();
        let [gx, gy, gz]: [f64; 3] = (*gyro).into();
        let [q0, q1, q2, q3]: [f64; 4] = self.q.into();

        // Gravity alignment residual
        let f = Vector3::new(
            2.0 * (q1 * q3 - q0 * q2) - ax,
            2.0 * (q0 * q1 + q2 * q3) - ay,
            2.0 * (0.5 - q1 * q1 - q2 * q2) - az,
        );

        // Jacobian rows, one per residual component
        let j = [
            Vector4::new(-2.0 * q2, 2.0 * q3, -2.0 * q0, 2.0 * q1),
            Vector4::new(2.0 * q1, 2.0 * q0, 2.0 * q3, 2.0 * q2),
            Vector4::new(0.0, -4.0 * q1, -4.0 * q2, 0.0),
        ];

        let mut step = j[0] * f.x + j[1] * f.y + j[2] * f.z;
        let step_norm = step.norm();
        if step_norm > MIN_STEP {
            step /= step_norm;
        }

        // Rate of change of quaternion from the gyroscope
        let q_dot = Vector4::new(
            0.5 * (-q1 * gx - q2 * gy - q3 * gz),
            0.5 * (q0 * gx + q2 * gz - q3 * gy),
            0.5 * (q0 * gy - q1 * gz + q3 * gx),
            0.5 * (q0 * gz + q1 * gy - q2 * gx),
        ) - step * self.beta;

        let integrated = self.q + q_dot * dt;
        let norm = integrated.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return Err(FilterError::NonFinite);
        }
        self.q = integrated / norm;
        Ok(())
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        let [w, x, y, z]: [f64; 4] = self.q.into();
        UnitQuaternion::new_unchecked(Quaternion::new(w, x, y, z))
    }

    fn reset(&mut self) {
        self.q = Vector4::new(1.0, 0.0, 0.0, 0.0);
    }
}

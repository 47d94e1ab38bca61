use super::{
    delta_rotation, gravity_direction, is_finite_quaternion, skew, FilterError, OrientationFilter,
};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Rotations smaller than this are treated as no rotation.
const MIN_ROTATION: f64 = 1e-6;

const INITIAL_COVARIANCE: f64 = 0.1;
const PROCESS_NOISE: f64 = 0.001;
const MEASUREMENT_NOISE: f64 = 0.1;

/// Gravity in the world frame, as the accelerometer model expects it.
fn world_gravity() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -1.0)
}

#[derive(Debug, Clone, Copy)]
struct KalmanState {
    orientation: UnitQuaternion<f64>,
    /// Attitude error covariance.
    covariance: Matrix3<f64>,
}

impl KalmanState {
    fn initial() -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            covariance: Matrix3::identity() * INITIAL_COVARIANCE,
        }
    }
}

/// Simplified attitude EKF.
///
/// The error state is a 3-vector of small rotations. The gyro drives the
/// prediction; the normalized accelerometer is the gravity measurement.
pub struct KalmanFilter {
    state: KalmanState,
    process_noise: Matrix3<f64>,
    measurement_noise: Matrix3<f64>,
}

impl KalmanFilter {
    pub fn new() -> Self {
        Self {
            state: KalmanState::initial(),
            process_noise: Matrix3::identity() * PROCESS_NOISE,
            measurement_noise: Matrix3::identity() * MEASUREMENT_NOISE,
        }
    }

    pub fn covariance(&self) -> Matrix3<f64> {
        self.state.covariance
    }

    fn predict(&self, state: &mut KalmanState, gyro: &Vector3<f64>, dt: f64) {
        let delta_theta = gyro * dt;

        state.orientation *= delta_rotation(&delta_theta, MIN_ROTATION);
        state.orientation.renormalize();

        let f = Matrix3::identity() - skew(&delta_theta);
        state.covariance = f * state.covariance * f.transpose() + self.process_noise;
    }

    fn correct(&self, state: &mut KalmanState, up: &Vector3<f64>) -> Result<(), FilterError> {
        // Gravity as the current estimate expects to see it in the body frame
        let h = state.orientation.conjugate() * world_gravity();
        let residual = up - h;

        let h_jacobian = -skew(&h);
        let p = state.covariance;
        let innovation = h_jacobian * p * h_jacobian.transpose() + self.measurement_noise;
        let innovation_inv = innovation
            .try_inverse()
            .ok_or(FilterError::SingularInnovation)?;
        let gain = p * h_jacobian.transpose() * innovation_inv;

        let delta_theta = gain * residual;
        state.orientation = delta_rotation(&delta_theta, MIN_ROTATION) * state.orientation;
        state.orientation.renormalize();

        state.covariance = (Matrix3::identity() - gain * h_jacobian) * p;
        Ok(())
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl OrientationFilter for KalmanFilter {
    fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        dt: f64,
    ) -> Result<(), FilterError> {
        let up = gravity_direction(accel)?;

        let mut next = self.state;
        self.predict(&mut next, gyro, dt);
        self.correct(&mut next, &up)?;

        if !is_finite_quaternion(&next.orientation)
            || next.covariance.iter().any(|v| !v.is_finite())
        {
            return Err(FilterError::NonFinite);
        }
        self.state = next;
        Ok(())
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        self.state.orientation
    }

    fn reset(&mut self) {
        self.state = KalmanState::initial();
    }
}

use glam::Quat;
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// One accelerometer + gyroscope reading delivered by a transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Monotonic capture time in microseconds.
    pub timestamp_us: u64,
    /// Linear acceleration (m/s^2).
    pub accel: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_us: u64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp_us,
            accel,
            gyro,
        }
    }
}

/// Latest fused orientation, in the single-precision form renderers consume.
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    /// Absolute orientation as a unit quaternion.
    pub quaternion: Quat,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            quaternion: Quat::IDENTITY,
        }
    }
}

impl From<&UnitQuaternion<f64>> for Orientation {
    fn from(q: &UnitQuaternion<f64>) -> Self {
        Self {
            quaternion: Quat::from_xyzw(q.i as f32, q.j as f32, q.k as f32, q.w as f32),
        }
    }
}

/// Per-sensor bias and scale corrections.
///
/// Raw readings are corrected as `scale * (raw - bias)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    #[serde(with = "vector3_serde")]
    pub accel_bias: Vector3<f64>,
    #[serde(with = "matrix3_serde")]
    pub accel_scale: Matrix3<f64>,
    #[serde(with = "vector3_serde")]
    pub gyro_bias: Vector3<f64>,
    #[serde(with = "matrix3_serde")]
    pub gyro_scale: Matrix3<f64>,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self {
            accel_bias: Vector3::zeros(),
            accel_scale: Matrix3::identity(),
            gyro_bias: Vector3::zeros(),
            gyro_scale: Matrix3::identity(),
        }
    }
}

/// Smallest |det| accepted for a scale matrix.
const MIN_SCALE_DETERMINANT: f64 = 1e-12;

impl CalibrationData {
    pub fn correct_accel(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        self.accel_scale * (raw - self.accel_bias)
    }

    pub fn correct_gyro(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        self.gyro_scale * (raw - self.gyro_bias)
    }

    /// All fields finite and both scale matrices invertible.
    pub fn is_usable(&self) -> bool {
        let finite = self.accel_bias.iter().all(|v| v.is_finite())
            && self.gyro_bias.iter().all(|v| v.is_finite())
            && self.accel_scale.iter().all(|v| v.is_finite())
            && self.gyro_scale.iter().all(|v| v.is_finite());

        finite
            && self.accel_scale.determinant().abs() > MIN_SCALE_DETERMINANT
            && self.gyro_scale.determinant().abs() > MIN_SCALE_DETERMINANT
    }
}

// Serde helpers for nalgebra types: plain arrays read better in TOML than
// nalgebra's column-major flat encoding.

mod vector3_serde {
    use nalgebra::Vector3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Vector3<f64>, s: S) -> Result<S::Ok, S::Error> {
        [v.x, v.y, v.z].serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vector3<f64>, D::Error> {
        let [x, y, z] = <[f64; 3]>::deserialize(d)?;
        Ok(Vector3::new(x, y, z))
    }
}

/// Matrices are written row-major, one inner array per row.
mod matrix3_serde {
    use nalgebra::Matrix3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &Matrix3<f64>, s: S) -> Result<S::Ok, S::Error> {
        let rows: [[f64; 3]; 3] =
            std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]));
        rows.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Matrix3<f64>, D::Error> {
        let rows = <[[f64; 3]; 3]>::deserialize(d)?;
        Ok(Matrix3::from_fn(|r, c| rows[r][c]))
    }
}

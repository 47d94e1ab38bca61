use crate::calibration::{CalibrationConfig, CalibrationEngine, CalibrationError};
use crate::filter::{create_filter, slerp, FilterError, FilterParams, FilterType, OrientationFilter};
use crate::types::{CalibrationData, ImuSample, Orientation};
use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Samples closer together than this are dropped.
const MIN_SAMPLE_INTERVAL_US: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Sample contains non-finite values")]
    NonFinite,
    #[error("Acceleration magnitude {magnitude} m/s^2 outside [{min}, {max}]")]
    AccelOutOfRange { magnitude: f64, min: f64, max: f64 },
    #[error("Angular rate magnitude {magnitude} rad/s exceeds {max}")]
    GyroOutOfRange { magnitude: f64, max: f64 },
}

/// Every failure the pipeline reports on its event channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    #[error("Invalid IMU data: {0}")]
    Validation(#[from] ValidationError),
    #[error("Failed to create {kind} filter: {source}")]
    FilterConstruction { kind: FilterType, source: FilterError },
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Orientation update error: {0}")]
    Numerical(FilterError),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Plausibility limits applied to every raw sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Inclusive acceleration magnitude bounds (m/s^2).
    pub accel_min: f64,
    pub accel_max: f64,
    /// Inclusive angular rate magnitude ceiling (rad/s).
    pub gyro_max: f64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            // 0.1 g .. 4 g
            accel_min: 0.981,
            accel_max: 39.24,
            // 500 deg/s
            gyro_max: 8.726,
        }
    }
}

impl ValidationLimits {
    pub fn check(&self, sample: &ImuSample) -> Result<(), ValidationError> {
        let finite = sample.accel.iter().chain(sample.gyro.iter()).all(|v| v.is_finite());
        if !finite {
            return Err(ValidationError::NonFinite);
        }

        let accel = sample.accel.norm();
        if accel < self.accel_min || accel > self.accel_max {
            return Err(ValidationError::AccelOutOfRange {
                magnitude: accel,
                min: self.accel_min,
                max: self.accel_max,
            });
        }

        let gyro = sample.gyro.norm();
        if gyro > self.gyro_max {
            return Err(ValidationError::GyroOutOfRange {
                magnitude: gyro,
                max: self.gyro_max,
            });
        }

        Ok(())
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Filter active at startup.
    pub filter: FilterType,
    /// Slerp each output toward the previous one.
    pub smoothing: bool,
    /// Weight of the new orientation when smoothing, in (0, 1].
    pub smoothing_factor: f64,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    pub filter_params: FilterParams,
    pub limits: ValidationLimits,
    pub calibration: CalibrationConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            filter: FilterType::default(),
            smoothing: true,
            smoothing_factor: 0.7,
            event_capacity: 1024,
            filter_params: FilterParams::default(),
            limits: ValidationLimits::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

/// Emitted by the pipeline, in the order samples and commands were accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionEvent {
    Orientation {
        timestamp_us: u64,
        orientation: UnitQuaternion<f64>,
    },
    Calibration(CalibrationData),
    Error(FusionError),
}

/// What happened to a sample handed to [`SensorFusion::process_sample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// The filter advanced and this orientation was emitted.
    Orientation(UnitQuaternion<f64>),
    /// Stored for the running calibration session.
    Buffered,
    /// Too close to (or before) the previous accepted sample.
    Dropped,
}

struct FusionState {
    filter: Box<dyn OrientationFilter>,
    filter_type: FilterType,
    calibration: CalibrationData,
    calibration_engine: CalibrationEngine,
    last_timestamp: Option<u64>,
    /// Last emitted orientation when smoothing.
    smoothed: Option<UnitQuaternion<f64>>,
    sample_count: u64,
}

/// Validation, calibration and orientation filtering for one IMU.
///
/// Shared between the transport task that feeds samples and whoever drives
/// the controls. Every operation takes the single state lock for its whole
/// duration, and events are queued while it is held.
pub struct SensorFusion {
    config: FusionConfig,
    state: Mutex<FusionState>,
    events: mpsc::Sender<FusionEvent>,
    latest: watch::Sender<Orientation>,
    dropped_events: AtomicU64,
}

impl SensorFusion {
    /// Build the pipeline with the configured startup filter.
    ///
    /// Returns the event receiver alongside. Failing to build the startup
    /// filter is fatal.
    pub fn new(config: FusionConfig) -> Result<(Self, mpsc::Receiver<FusionEvent>), FusionError> {
        let filter = create_filter(config.filter, &config.filter_params).map_err(|source| {
            FusionError::FilterConstruction {
                kind: config.filter,
                source,
            }
        })?;

        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (latest, _) = watch::channel(Orientation::default());

        let fusion = Self {
            config,
            state: Mutex::new(FusionState {
                filter,
                filter_type: config.filter,
                calibration: CalibrationData::default(),
                calibration_engine: CalibrationEngine::new(config.calibration),
                last_timestamp: None,
                smoothed: None,
                sample_count: 0,
            }),
            events,
            latest,
            dropped_events: AtomicU64::new(0),
        };

        tracing::info!(filter = %config.filter, "Sensor fusion ready");
        Ok((fusion, events_rx))
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Run one raw sample through validation, calibration and the filter.
    pub fn process_sample(&self, sample: &ImuSample) -> Result<SampleOutcome, FusionError> {
        let mut state = self.lock();

        if let Err(e) = self.config.limits.check(sample) {
            tracing::debug!(?e, "Rejected IMU sample");
            return Err(self.fail(e.into()));
        }

        if state.calibration_engine.is_collecting() {
            state.calibration_engine.push(sample);
            return Ok(SampleOutcome::Buffered);
        }

        let dt = match state.last_timestamp {
            None => 0.0,
            Some(last) => match sample.timestamp_us.checked_sub(last) {
                Some(delta) if delta >= MIN_SAMPLE_INTERVAL_US => delta as f64 / 1e6,
                _ => {
                    tracing::trace!(timestamp_us = sample.timestamp_us, last, "Dropped sample");
                    return Ok(SampleOutcome::Dropped);
                }
            },
        };

        let accel = state.calibration.correct_accel(&sample.accel);
        let gyro = state.calibration.correct_gyro(&sample.gyro);

        if let Err(e) = state.filter.update(&accel, &gyro, dt) {
            tracing::warn!(?e, filter = %state.filter_type, "Orientation update failed");
            return Err(self.fail(FusionError::Numerical(e)));
        }
        state.last_timestamp = Some(sample.timestamp_us);

        let mut orientation = state.filter.orientation();
        if self.config.smoothing {
            if let Some(previous) = state.smoothed {
                orientation = slerp(&previous, &orientation, self.config.smoothing_factor);
            }
            state.smoothed = Some(orientation);
        }

        state.sample_count += 1;
        if state.sample_count % 1000 == 0 {
            tracing::debug!(sample_count = state.sample_count, "IMU samples processed");
        }

        self.emit(FusionEvent::Orientation {
            timestamp_us: sample.timestamp_us,
            orientation,
        });
        self.latest.send_replace(Orientation::from(&orientation));
        Ok(SampleOutcome::Orientation(orientation))
    }

    /// Replace the active filter with a freshly built one.
    ///
    /// The previous filter's estimate is discarded entirely, including the
    /// smoothing history. On failure the previous filter stays active.
    pub fn set_filter_type(&self, kind: FilterType) -> Result<(), FusionError> {
        let mut state = self.lock();

        let filter = match create_filter(kind, &self.config.filter_params) {
            Ok(filter) => filter,
            Err(source) => {
                tracing::warn!(%kind, ?source, "Keeping previous filter");
                return Err(self.fail(FusionError::FilterConstruction { kind, source }));
            }
        };

        state.filter = filter;
        state.filter_type = kind;
        state.smoothed = None;
        tracing::info!(filter = %kind, "Orientation filter switched");
        Ok(())
    }

    /// Install externally supplied calibration, bypassing a session.
    pub fn set_calibration_data(&self, data: CalibrationData) -> Result<(), FusionError> {
        let mut state = self.lock();
        if !data.is_usable() {
            return Err(self.fail(CalibrationError::InvalidData.into()));
        }
        state.calibration = data;
        self.emit(FusionEvent::Calibration(data));
        tracing::info!("Calibration data loaded");
        Ok(())
    }

    /// Start a stationary calibration session. Samples are buffered instead
    /// of filtered until the session finishes.
    pub fn start_calibration(&self) {
        let mut state = self.lock();
        state.calibration_engine.start();
        // The next filtered sample should not integrate over the session.
        state.last_timestamp = None;
        tracing::info!("Calibration started");
    }

    /// Finish the running session and install its result.
    pub fn finish_calibration(&self) -> Result<CalibrationData, FusionError> {
        let mut state = self.lock();
        match state.calibration_engine.finish() {
            Ok(data) => {
                state.calibration = data;
                self.emit(FusionEvent::Calibration(data));
                Ok(data)
            }
            Err(e) => {
                tracing::warn!(%e, "Calibration not applied");
                Err(self.fail(e.into()))
            }
        }
    }

    /// Abandon the running session without touching the active calibration.
    pub fn cancel_calibration(&self) {
        self.lock().calibration_engine.cancel();
        tracing::info!("Calibration cancelled");
    }

    /// Reset the active filter to identity. Calibration is kept.
    pub fn reset_orientation(&self) {
        let mut state = self.lock();
        state.filter.reset();
        tracing::info!(filter = %state.filter_type, "Orientation reset");
    }

    /// Surface an upstream transport failure. Pipeline state is not touched.
    pub fn report_transport_error(&self, message: impl Into<String>) {
        let _state = self.lock();
        self.fail(FusionError::Transport(message.into()));
    }

    pub fn calibration_data(&self) -> CalibrationData {
        self.lock().calibration
    }

    pub fn filter_type(&self) -> FilterType {
        self.lock().filter_type
    }

    pub fn is_calibrating(&self) -> bool {
        self.lock().calibration_engine.is_collecting()
    }

    /// Buffered (accel, gyro) calibration sample counts.
    pub fn calibration_progress(&self) -> (usize, usize) {
        self.lock().calibration_engine.buffered()
    }

    /// The active filter's estimate, before smoothing.
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.lock().filter.orientation()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.lock().last_timestamp
    }

    /// Latest emitted orientation, for consumers that only want the newest value.
    pub fn subscribe_orientation(&self) -> watch::Receiver<Orientation> {
        self.latest.subscribe()
    }

    /// Events discarded because the event channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, FusionState> {
        // Filters commit atomically, so state behind a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an error event and hand the error back to the caller.
    fn fail(&self, error: FusionError) -> FusionError {
        self.emit(FusionEvent::Error(error.clone()));
        error
    }

    /// Never blocks: a full channel drops the event.
    fn emit(&self, event: FusionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    tracing::warn!(dropped, "Event channel full, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CALIBRATION_SAMPLES;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    const STEP_US: u64 = 10_000;

    fn still(t: u64) -> ImuSample {
        ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    fn spinning(t: u64) -> ImuSample {
        ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::new(3.0, -1.0, 0.5))
    }

    fn unsmoothed(filter: FilterType) -> FusionConfig {
        FusionConfig {
            filter,
            smoothing: false,
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<FusionEvent>) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn orientation_count(events: &[FusionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, FusionEvent::Orientation { .. }))
            .count()
    }

    #[test]
    fn orientation_stays_unit_for_every_filter() {
        for kind in [FilterType::Complementary, FilterType::Madgwick, FilterType::Kalman] {
            let (fusion, _rx) = SensorFusion::new(FusionConfig {
                filter: kind,
                ..Default::default()
            })
            .unwrap();

            for i in 0..500u64 {
                let t = i as f64 * 0.01;
                let sample = ImuSample::new(
                    i * STEP_US,
                    Vector3::new(3.0 * (2.0 * t).sin(), 1.5 * t.sin(), 9.81 + 0.5 * t.cos()),
                    Vector3::new(0.3 * t.sin(), 0.3 * t.cos(), 1.0),
                );
                let SampleOutcome::Orientation(q) = fusion.process_sample(&sample).unwrap() else {
                    panic!("sample {i} not filtered");
                };
                assert!((q.coords.norm() - 1.0).abs() < 1e-9, "{kind}: {q:?}");
                assert!((fusion.orientation().coords.norm() - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn gravity_only_input_settles_at_identity() {
        for (kind, tolerance) in [
            (FilterType::Complementary, 1e-6),
            (FilterType::Madgwick, 1e-6),
            (FilterType::Kalman, 1e-3),
        ] {
            let (fusion, _rx) = SensorFusion::new(FusionConfig {
                filter: kind,
                ..Default::default()
            })
            .unwrap();

            let mut last = UnitQuaternion::identity();
            for i in 0..=200u64 {
                if let SampleOutcome::Orientation(q) = fusion.process_sample(&still(i * STEP_US)).unwrap() {
                    last = q;
                }
            }
            assert!(last.angle() < tolerance, "{kind}: {}", last.angle());
        }
    }

    #[test]
    fn tilted_start_recovers_under_gravity_only_input() {
        let (fusion, _rx) = SensorFusion::new(unsmoothed(FilterType::Kalman)).unwrap();
        for i in 0..20u64 {
            fusion.process_sample(&spinning(i * STEP_US)).unwrap();
        }
        assert!(fusion.orientation().angle() > 0.01);

        for i in 20..420u64 {
            fusion.process_sample(&still(i * STEP_US)).unwrap();
        }
        // Yaw is unobservable from gravity; only roll and pitch must settle.
        let (roll, pitch, _) = fusion.orientation().euler_angles();
        assert!(roll.abs() < 0.01 && pitch.abs() < 0.01, "roll {roll}, pitch {pitch}");
    }

    #[test]
    fn accel_bounds_are_inclusive() {
        let limits = ValidationLimits::default();
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();

        let at_min = ImuSample::new(0, Vector3::new(0.0, 0.0, limits.accel_min), Vector3::zeros());
        let at_max = ImuSample::new(
            STEP_US,
            Vector3::new(0.0, 0.0, limits.accel_max),
            Vector3::zeros(),
        );
        assert!(matches!(fusion.process_sample(&at_min), Ok(SampleOutcome::Orientation(_))));
        assert!(matches!(fusion.process_sample(&at_max), Ok(SampleOutcome::Orientation(_))));
        assert_eq!(orientation_count(&drain(&mut rx)), 2);

        let before = fusion.orientation();
        for accel in [limits.accel_min - 0.01, limits.accel_max + 0.01] {
            let sample = ImuSample::new(5 * STEP_US, Vector3::new(0.0, 0.0, accel), Vector3::zeros());
            let err = fusion.process_sample(&sample).unwrap_err();
            assert!(matches!(
                err,
                FusionError::Validation(ValidationError::AccelOutOfRange { .. })
            ));

            let events = drain(&mut rx);
            assert_eq!(events, vec![FusionEvent::Error(err)]);
        }
        assert_eq!(fusion.last_timestamp(), Some(STEP_US));
        assert_eq!(fusion.orientation(), before);
    }

    #[test]
    fn non_finite_and_fast_rotation_are_rejected() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();

        let nan = ImuSample::new(0, Vector3::new(f64::NAN, 0.0, 9.81), Vector3::zeros());
        assert_eq!(
            fusion.process_sample(&nan),
            Err(FusionError::Validation(ValidationError::NonFinite))
        );

        let inf_gyro = ImuSample::new(
            0,
            Vector3::new(0.0, 0.0, 9.81),
            Vector3::new(0.0, f64::INFINITY, 0.0),
        );
        assert!(fusion.process_sample(&inf_gyro).is_err());

        let too_fast = ImuSample::new(0, Vector3::new(0.0, 0.0, 9.81), Vector3::new(0.0, 0.0, 9.0));
        assert!(matches!(
            fusion.process_sample(&too_fast),
            Err(FusionError::Validation(ValidationError::GyroOutOfRange { .. }))
        ));

        assert_eq!(fusion.last_timestamp(), None);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn samples_under_a_millisecond_apart_are_dropped() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();

        assert!(matches!(fusion.process_sample(&still(5_000)), Ok(SampleOutcome::Orientation(_))));
        assert_eq!(fusion.process_sample(&still(5_999)), Ok(SampleOutcome::Dropped));
        assert_eq!(fusion.last_timestamp(), Some(5_000));

        // Going backwards is dropped the same way.
        assert_eq!(fusion.process_sample(&still(1_000)), Ok(SampleOutcome::Dropped));

        // Exactly one millisecond is enough.
        assert!(matches!(fusion.process_sample(&still(6_000)), Ok(SampleOutcome::Orientation(_))));
        assert_eq!(fusion.last_timestamp(), Some(6_000));

        assert_eq!(orientation_count(&drain(&mut rx)), 2);
    }

    #[test]
    fn calibration_session_with_identical_samples() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();
        fusion.process_sample(&still(0)).unwrap();
        drain(&mut rx);

        fusion.start_calibration();
        assert!(fusion.is_calibrating());
        for _ in 0..CALIBRATION_SAMPLES {
            // Same timestamp every time: calibration does not apply the interval gate.
            assert_eq!(fusion.process_sample(&still(42)), Ok(SampleOutcome::Buffered));
        }
        assert_eq!(fusion.calibration_progress(), (CALIBRATION_SAMPLES, CALIBRATION_SAMPLES));

        let data = fusion.finish_calibration().unwrap();
        assert!(!fusion.is_calibrating());
        assert_relative_eq!(data.accel_bias, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(data.gyro_bias, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(data.accel_scale, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(data.gyro_scale, Matrix3::identity(), epsilon = 1e-12);
        assert_eq!(fusion.calibration_data(), data);

        // Calibration samples never produce orientations.
        assert_eq!(drain(&mut rx), vec![FusionEvent::Calibration(data)]);

        // Filtering resumes with a fresh time base.
        assert_eq!(fusion.last_timestamp(), None);
        assert!(matches!(fusion.process_sample(&still(50)), Ok(SampleOutcome::Orientation(_))));
    }

    #[test]
    fn short_calibration_keeps_previous_data() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();
        let loaded = CalibrationData {
            gyro_bias: Vector3::new(0.01, 0.02, 0.03),
            ..Default::default()
        };
        fusion.set_calibration_data(loaded).unwrap();
        drain(&mut rx);

        fusion.start_calibration();
        for i in 0..(CALIBRATION_SAMPLES as u64 / 2) {
            fusion.process_sample(&still(i * STEP_US)).unwrap();
        }
        let err = fusion.finish_calibration().unwrap_err();
        assert!(matches!(
            err,
            FusionError::Calibration(CalibrationError::InsufficientSamples { .. })
        ));
        assert_eq!(fusion.calibration_data(), loaded);
        assert_eq!(drain(&mut rx), vec![FusionEvent::Error(err)]);
        assert!(fusion.is_calibrating());
    }

    #[test]
    fn calibration_is_applied_before_filtering() {
        let (fusion, _rx) = SensorFusion::new(unsmoothed(FilterType::Complementary)).unwrap();
        // The sensor reads gravity tilted onto +y; calibration swaps it back onto z.
        let accel_scale = Matrix3::new(1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0);
        fusion
            .set_calibration_data(CalibrationData {
                accel_scale,
                ..Default::default()
            })
            .unwrap();

        for i in 0..100u64 {
            let sample = ImuSample::new(i * STEP_US, Vector3::new(0.0, 9.81, 0.0), Vector3::zeros());
            fusion.process_sample(&sample).unwrap();
        }
        assert!(fusion.orientation().angle() < 1e-9);
    }

    #[test]
    fn singular_calibration_is_rejected() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig::default()).unwrap();
        let bad = CalibrationData {
            accel_scale: Matrix3::zeros(),
            ..Default::default()
        };
        assert_eq!(
            fusion.set_calibration_data(bad),
            Err(FusionError::Calibration(CalibrationError::InvalidData))
        );
        assert_eq!(fusion.calibration_data(), CalibrationData::default());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn filter_failure_leaves_pipeline_untouched() {
        let (fusion, mut rx) = SensorFusion::new(unsmoothed(FilterType::Kalman)).unwrap();
        fusion.process_sample(&spinning(0)).unwrap();
        let before = fusion.orientation();
        drain(&mut rx);

        // A bias equal to the reading corrects the accelerometer to zero.
        fusion
            .set_calibration_data(CalibrationData {
                accel_bias: Vector3::new(0.0, 0.0, 9.81),
                ..Default::default()
            })
            .unwrap();
        let err = fusion.process_sample(&still(STEP_US)).unwrap_err();
        assert_eq!(err, FusionError::Numerical(FilterError::DegenerateAcceleration));
        assert_eq!(fusion.orientation(), before);
        assert_eq!(fusion.last_timestamp(), Some(0));

        fusion.set_calibration_data(CalibrationData::default()).unwrap();
        assert!(fusion.process_sample(&still(2 * STEP_US)).is_ok());
    }

    #[test]
    fn switching_filters_discards_previous_estimate() {
        let (fusion, _rx) = SensorFusion::new(FusionConfig {
            filter: FilterType::Kalman,
            ..Default::default()
        })
        .unwrap();
        for i in 0..30u64 {
            fusion.process_sample(&spinning(i * STEP_US)).unwrap();
        }
        assert!(fusion.orientation().angle() > 0.01);

        fusion.set_filter_type(FilterType::Madgwick).unwrap();
        assert_eq!(fusion.filter_type(), FilterType::Madgwick);
        assert_eq!(fusion.orientation(), UnitQuaternion::identity());

        // Smoothing is on, yet nothing of the Kalman estimate leaks through.
        let SampleOutcome::Orientation(q) = fusion.process_sample(&still(30 * STEP_US)).unwrap() else {
            panic!("sample not filtered");
        };
        assert!(q.angle() < 1e-9, "{}", q.angle());
    }

    #[test]
    fn failed_switch_keeps_previous_filter() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig {
            filter: FilterType::Kalman,
            filter_params: FilterParams {
                madgwick_beta: -1.0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        for i in 0..10u64 {
            fusion.process_sample(&spinning(i * STEP_US)).unwrap();
        }
        let before = fusion.orientation();
        drain(&mut rx);

        let err = fusion.set_filter_type(FilterType::Madgwick).unwrap_err();
        assert!(matches!(
            err,
            FusionError::FilterConstruction {
                kind: FilterType::Madgwick,
                source: FilterError::InvalidParameter { .. }
            }
        ));
        assert_eq!(fusion.filter_type(), FilterType::Kalman);
        assert_eq!(fusion.orientation(), before);
        assert_eq!(drain(&mut rx), vec![FusionEvent::Error(err)]);
    }

    #[test]
    fn invalid_startup_filter_is_fatal() {
        let config = FusionConfig {
            filter: FilterType::Complementary,
            filter_params: FilterParams {
                accel_weight: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            SensorFusion::new(config),
            Err(FusionError::FilterConstruction { .. })
        ));
    }

    #[test]
    fn reset_orientation_keeps_calibration() {
        let (fusion, _rx) = SensorFusion::new(unsmoothed(FilterType::Madgwick)).unwrap();
        let loaded = CalibrationData {
            gyro_bias: Vector3::new(0.001, 0.0, 0.0),
            ..Default::default()
        };
        fusion.set_calibration_data(loaded).unwrap();
        for i in 0..10u64 {
            fusion.process_sample(&spinning(i * STEP_US)).unwrap();
        }

        fusion.reset_orientation();
        assert_eq!(fusion.orientation(), UnitQuaternion::identity());
        assert_eq!(fusion.calibration_data(), loaded);
        assert_eq!(fusion.last_timestamp(), Some(9 * STEP_US));
    }

    #[test]
    fn smoothing_blends_toward_new_estimate() {
        let (smooth, _rx1) = SensorFusion::new(FusionConfig {
            filter: FilterType::Complementary,
            ..Default::default()
        })
        .unwrap();
        let (raw, _rx2) = SensorFusion::new(unsmoothed(FilterType::Complementary)).unwrap();

        let mut smooth_q = UnitQuaternion::identity();
        let mut raw_q = UnitQuaternion::identity();
        for i in 0..5u64 {
            if let Ok(SampleOutcome::Orientation(q)) = smooth.process_sample(&spinning(i * STEP_US)) {
                smooth_q = q;
            }
            if let Ok(SampleOutcome::Orientation(q)) = raw.process_sample(&spinning(i * STEP_US)) {
                raw_q = q;
            }
        }
        // The smoothed output lags behind the raw filter.
        assert!(smooth_q.angle() < raw_q.angle());
        assert_eq!(smooth.orientation(), raw.orientation());
    }

    #[test]
    fn events_arrive_in_acceptance_order() {
        let (fusion, mut rx) = SensorFusion::new(unsmoothed(FilterType::Madgwick)).unwrap();
        fusion.process_sample(&still(0)).unwrap();
        let _ = fusion.finish_calibration();
        fusion.process_sample(&still(STEP_US)).unwrap();
        fusion.report_transport_error("socket closed");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], FusionEvent::Orientation { timestamp_us: 0, .. }));
        assert!(matches!(events[1], FusionEvent::Error(FusionError::Calibration(_))));
        assert!(matches!(events[2], FusionEvent::Orientation { timestamp_us: STEP_US, .. }));
        assert_eq!(
            events[3],
            FusionEvent::Error(FusionError::Transport("socket closed".into()))
        );
    }

    #[test]
    fn full_channel_drops_events_without_blocking() {
        let (fusion, mut rx) = SensorFusion::new(FusionConfig {
            event_capacity: 2,
            ..Default::default()
        })
        .unwrap();
        for i in 0..5u64 {
            assert!(fusion.process_sample(&still(i * STEP_US)).is_ok());
        }
        assert_eq!(fusion.dropped_events(), 3);

        // The oldest events are the ones kept.
        let events = drain(&mut rx);
        assert!(matches!(events[0], FusionEvent::Orientation { timestamp_us: 0, .. }));
        assert!(matches!(events[1], FusionEvent::Orientation { timestamp_us: STEP_US, .. }));
    }

    #[test]
    fn latest_orientation_is_published() {
        let (fusion, _rx) = SensorFusion::new(unsmoothed(FilterType::Kalman)).unwrap();
        let latest = fusion.subscribe_orientation();
        for i in 0..10u64 {
            fusion.process_sample(&spinning(i * STEP_US)).unwrap();
        }
        let published = latest.borrow().quaternion;
        let expected = Orientation::from(&fusion.orientation()).quaternion;
        assert!(published.abs_diff_eq(expected, 1e-6));
    }
}

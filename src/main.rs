use anyhow::Result;
use glam::EulerRot;
use imu_config::{AppConfig, TransportMode};
use imu_fusion::{FilterType, FusionEvent, ImuClient, Orientation, SensorFusion};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Minimum spacing between logged orientations.
const ORIENTATION_LOG_INTERVAL: Duration = Duration::from_millis(500);

const HELP: &str = "commands: c = start calibration, f = finish calibration, \
x = cancel calibration, r = reset orientation, 1/2/3 or a filter name = complementary/madgwick/kalman, \
s = save calibration, l = load calibration, p = status, q = quit";

/// Console commands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    StartCalibration,
    FinishCalibration,
    CancelCalibration,
    Reset,
    SetFilter(FilterType),
    SaveCalibration,
    LoadCalibration,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let command = match line {
            "c" => Self::StartCalibration,
            "f" => Self::FinishCalibration,
            "x" => Self::CancelCalibration,
            "r" => Self::Reset,
            "1" => Self::SetFilter(FilterType::Complementary),
            "2" => Self::SetFilter(FilterType::Madgwick),
            "3" => Self::SetFilter(FilterType::Kalman),
            "s" => Self::SaveCalibration,
            "l" => Self::LoadCalibration,
            "p" => Self::Status,
            "h" | "?" => Self::Help,
            "q" => Self::Quit,
            other => Self::SetFilter(other.parse().ok()?),
        };
        Some(command)
    }
}

/// Console-side state.
struct App {
    fusion: Arc<SensorFusion>,
    calibration_path: Option<PathBuf>,
}

impl App {
    /// Apply one console command. Returns `false` when the app should exit.
    fn handle(&self, command: Command) -> bool {
        match command {
            Command::StartCalibration => {
                self.fusion.start_calibration();
                info!("Keep the sensor still and level, then enter 'f'");
            }
            Command::FinishCalibration => {
                // Success is reported through the event stream.
                if let Err(e) = self.fusion.finish_calibration() {
                    let (accel, gyro) = self.fusion.calibration_progress();
                    warn!(%e, accel, gyro, "Calibration not finished");
                }
            }
            Command::CancelCalibration => self.fusion.cancel_calibration(),
            Command::Reset => self.fusion.reset_orientation(),
            Command::SetFilter(kind) => {
                let _ = self.fusion.set_filter_type(kind);
            }
            Command::SaveCalibration => match &self.calibration_path {
                Some(path) => {
                    let data = self.fusion.calibration_data();
                    if let Err(e) = imu_config::save_calibration(path, &data) {
                        error!(?e, "Failed to save calibration");
                    }
                }
                None => warn!("No calibration path available"),
            },
            Command::LoadCalibration => match &self.calibration_path {
                Some(path) => load_calibration_into(&self.fusion, path),
                None => warn!("No calibration path available"),
            },
            Command::Status => {
                let (accel, gyro) = self.fusion.calibration_progress();
                info!(
                    filter = %self.fusion.filter_type(),
                    calibrating = self.fusion.is_calibrating(),
                    accel_buffered = accel,
                    gyro_buffered = gyro,
                    dropped_events = self.fusion.dropped_events(),
                    "Status"
                );
            }
            Command::Help => info!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }
}

/// Install calibration from `path` if it parses and is usable.
fn load_calibration_into(fusion: &SensorFusion, path: &Path) {
    match imu_config::load_calibration(path) {
        // Rejection is reported through the event stream.
        Ok(data) => {
            let _ = fusion.set_calibration_data(data);
        }
        Err(e) => warn!(?e, "Failed to load calibration"),
    }
}

/// Yaw, pitch, roll in degrees.
fn euler_degrees(orientation: &Orientation) -> (f32, f32, f32) {
    let (yaw, pitch, roll) = orientation.quaternion.to_euler(EulerRot::ZYX);
    (yaw.to_degrees(), pitch.to_degrees(), roll.to_degrees())
}

/// Background task: drain pipeline events into the log.
async fn log_events(mut events: mpsc::Receiver<FusionEvent>) {
    let mut last_logged: Option<Instant> = None;

    while let Some(event) = events.recv().await {
        match event {
            FusionEvent::Orientation {
                timestamp_us,
                orientation,
            } => {
                if last_logged.is_some_and(|t| t.elapsed() < ORIENTATION_LOG_INTERVAL) {
                    continue;
                }
                last_logged = Some(Instant::now());

                let (yaw, pitch, roll) = euler_degrees(&Orientation::from(&orientation));
                info!(timestamp_us, yaw, pitch, roll, "Orientation");
            }
            FusionEvent::Calibration(data) => {
                info!(
                    accel_bias = ?data.accel_bias.as_slice(),
                    gyro_bias = ?data.gyro_bias.as_slice(),
                    "Calibration applied"
                );
            }
            FusionEvent::Error(e) => warn!(%e, "Fusion error"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imu_viz=info,imu_fusion=info,imu_config=info".into()),
        )
        .init();

    info!("IMU orientation visualizer starting");

    // Load config.
    let mut config = imu_config::load_config().unwrap_or_else(|e| {
        warn!(?e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    info!(
        filter = %config.fusion.filter,
        transport = ?config.transport.mode,
        "Config loaded"
    );

    let (fusion, events) = SensorFusion::new(config.fusion)?;
    let fusion = Arc::new(fusion);

    let calibration_path = imu_config::calibration_path()
        .map_err(|e| warn!(?e, "Calibration storage unavailable"))
        .ok();
    if let Some(path) = calibration_path.as_deref().filter(|p| p.exists()) {
        load_calibration_into(&fusion, path);
    }

    // Start the transport (fall back to mock if the port is unavailable).
    let client = match config.transport.mode {
        TransportMode::Mock => ImuClient::mock(fusion.clone()),
        TransportMode::Tcp => {
            let addr = config.transport.listen_addr.as_str();
            match ImuClient::listen(addr, fusion.clone()).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(?e, %addr, "TCP transport unavailable, using mock");
                    ImuClient::mock(fusion.clone())
                }
            }
        }
        TransportMode::Serial => {
            let port = config.transport.serial_port.as_str();
            let baud_rate = config.transport.baud_rate;
            match ImuClient::serial(port, baud_rate, fusion.clone()) {
                Ok(client) => client,
                Err(e) => {
                    let available = imu_fusion::available_ports().unwrap_or_default();
                    warn!(?e, %port, ?available, "Serial transport unavailable, using mock");
                    ImuClient::mock(fusion.clone())
                }
            }
        }
    };

    let logger = tokio::spawn(log_events(events));
    let app = App {
        fusion: fusion.clone(),
        calibration_path,
    };

    info!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if console_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match Command::parse(&line) {
                        Some(command) => {
                            if !app.handle(command) {
                                break;
                            }
                        }
                        None => warn!(input = line.trim(), "Unknown command"),
                    },
                    Ok(None) => {
                        info!("Console closed, press Ctrl+C to exit");
                        console_open = false;
                    }
                    Err(e) => {
                        error!(?e, "Console read error");
                        console_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(orientation = ?client.orientation().quaternion, "Shutting down");
    drop(client);
    logger.abort();

    // Persist the filter the session ended with.
    config.fusion.filter = fusion.filter_type();
    if let Err(e) = imu_config::save_config(&config) {
        error!(?e, "Failed to save config");
    }

    Ok(())
}

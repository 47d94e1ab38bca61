pub mod calibration;
pub mod filter;
pub mod fusion;
pub mod protocol;
mod stream;
pub mod types;

pub use calibration::{CalibrationConfig, CalibrationEngine, CalibrationError, CALIBRATION_SAMPLES};
pub use filter::{create_filter, FilterError, FilterParams, FilterType, OrientationFilter};
pub use fusion::{
    FusionConfig, FusionError, FusionEvent, SampleOutcome, SensorFusion, ValidationError,
    ValidationLimits,
};
pub use stream::SAMPLE_PERIOD_US;
pub use types::{CalibrationData, ImuSample, Orientation};

use anyhow::Result;
use nalgebra::Vector3;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::{elapsed_us, AxisMap, FrameStream};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Port the sensor board streams to by default.
pub const DEFAULT_PORT: u16 = 8080;

/// Baud rate of the board's USB serial link.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Mock transport sample period (100 Hz).
const MOCK_PERIOD: Duration = Duration::from_millis(10);

/// Serial read timeout; bounds how long shutdown waits on an idle port.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Feeds an IMU sample stream into a [`SensorFusion`] pipeline.
///
/// Listens for the sensor board on TCP, reads it from a serial port, or
/// generates synthetic motion for development without hardware. The
/// background task stops when the client is dropped.
pub struct ImuClient {
    orientation_rx: watch::Receiver<Orientation>,
    local_addr: Option<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ImuClient {
    /// Accept the sensor board on `addr` and stream its frames into `fusion`.
    ///
    /// One board is served at a time; further connections are closed while
    /// it stays connected.
    pub async fn listen(addr: impl ToSocketAddrs, fusion: Arc<SensorFusion>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "Listening for IMU stream");

        let orientation_rx = fusion.subscribe_orientation();
        let task = tokio::spawn(accept_loop(listener, fusion));

        Ok(Self {
            orientation_rx,
            local_addr: Some(local_addr),
            shutdown: Arc::default(),
            task,
        })
    }

    /// Open the board's serial port (8N1, no flow control) and stream its
    /// frames into `fusion` from a blocking reader task.
    pub fn serial(path: &str, baud_rate: u32, fusion: Arc<SensorFusion>) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()?;
        tracing::info!(%path, baud_rate, "Opened IMU serial port");

        let orientation_rx = fusion.subscribe_orientation();
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = tokio::task::spawn_blocking({
            let shutdown = shutdown.clone();
            move || serial_read_loop(port, &fusion, &shutdown)
        });

        Ok(Self {
            orientation_rx,
            local_addr: None,
            shutdown,
            task,
        })
    }

    /// Create a mock client that feeds figure-eight motion at 100 Hz.
    pub fn mock(fusion: Arc<SensorFusion>) -> Self {
        tracing::info!("Using mock IMU transport");
        let orientation_rx = fusion.subscribe_orientation();
        let task = tokio::spawn(mock_loop(fusion));
        Self {
            orientation_rx,
            local_addr: None,
            shutdown: Arc::default(),
            task,
        }
    }

    /// Get the latest fused orientation (non-blocking).
    pub fn orientation(&self) -> Orientation {
        *self.orientation_rx.borrow()
    }

    /// Bound address of the TCP listener, `None` for the other transports.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ImuClient {
    fn drop(&mut self) {
        // Blocking serial reads cannot be aborted; they poll this flag.
        self.shutdown.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

async fn accept_loop(listener: TcpListener, fusion: Arc<SensorFusion>) {
    let mut frames = FrameStream::new(Instant::now(), AxisMap::MirrorX);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(?e, "IMU accept error");
                fusion.report_transport_error(format!("accept failed: {e}"));
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        tracing::info!(%peer, "IMU board connected");
        frames.reset();
        serve_board(&listener, stream, &fusion, &mut frames).await;
        tracing::info!(%peer, "IMU board disconnected");
    }
}

/// Read one board's stream until it closes, turning away other connections.
async fn serve_board(
    listener: &TcpListener,
    mut stream: TcpStream,
    fusion: &SensorFusion,
    frames: &mut FrameStream,
) {
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::warn!("IMU TCP connection closed");
                        break;
                    }
                    Ok(n) => {
                        frames.feed(&buf[..n], fusion);
                    }
                    Err(e) => {
                        tracing::error!(?e, "IMU TCP read error");
                        fusion.report_transport_error(format!("read failed: {e}"));
                        break;
                    }
                }
            }
            extra = listener.accept() => {
                if let Ok((_, peer)) = extra {
                    tracing::warn!(%peer, "IMU board already connected, closing extra connection");
                }
            }
        }
    }
}

/// Blocking read loop for the serial link. Returns when `shutdown` is set,
/// the port closes, or a read fails.
fn serial_read_loop(mut port: impl Read, fusion: &SensorFusion, shutdown: &AtomicBool) {
    let mut frames = FrameStream::new(Instant::now(), AxisMap::Identity);
    let mut buf = [0u8; 1024];

    while !shutdown.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {
                tracing::warn!("IMU serial port closed");
                fusion.report_transport_error("serial port closed");
                break;
            }
            Ok(n) => {
                frames.feed(&buf[..n], fusion);
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                tracing::error!(?e, "IMU serial read error");
                fusion.report_transport_error(format!("read failed: {e}"));
                break;
            }
        }
    }
}

async fn mock_loop(fusion: Arc<SensorFusion>) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(MOCK_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let _ = fusion.process_sample(&mock_sample(elapsed_us(started)));
    }
}

/// Figure-eight motion around a level pose.
fn mock_sample(timestamp_us: u64) -> ImuSample {
    let t = timestamp_us as f64 / 1e6;
    let accel = Vector3::new(
        3.0 * (2.0 * t).sin(),
        3.0 * t.sin() * t.cos(),
        9.81 + 0.5 * (t / 2.0).sin(),
    );
    let gyro = Vector3::new(0.3 * (t / 2.0).sin(), 0.3 * (t / 2.0).cos(), 1.0);
    ImuSample::new(timestamp_us, accel, gyro)
}

mod types;

pub use types::*;

use anyhow::{Context, Result};
use imu_fusion::CalibrationData;
use std::path::{Path, PathBuf};
use tracing::info;

/// Returns the config directory: <platform config dir>/imu-viz/
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("imu-viz");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Returns the config file path: <config dir>/imu-viz/config.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Returns the default calibration file path: <config dir>/imu-viz/calibration.toml
pub fn calibration_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("calibration.toml"))
}

/// Load config from disk, or return default if not found.
pub fn load_config() -> Result<AppConfig> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!(?path, "Loaded config");
        Ok(config)
    } else {
        info!("No config found, using defaults");
        Ok(AppConfig::default())
    }
}

/// Save config to disk.
pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    info!(?path, "Saved config");
    Ok(())
}

/// Read calibration data written by [`save_calibration`].
///
/// Scale matrices must be invertible; anything else is rejected rather than
/// handed to the pipeline.
pub fn load_calibration(path: &Path) -> Result<CalibrationData> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read calibration {}", path.display()))?;
    let data: CalibrationData = toml::from_str(&contents)
        .with_context(|| format!("Invalid calibration file {}", path.display()))?;
    if !data.is_usable() {
        anyhow::bail!(
            "Calibration {} has non-finite values or a singular scale matrix",
            path.display()
        );
    }
    info!(?path, "Loaded calibration");
    Ok(data)
}

pub fn save_calibration(path: &Path, data: &CalibrationData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(data)?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write calibration {}", path.display()))?;
    info!(?path, "Saved calibration");
    Ok(())
}

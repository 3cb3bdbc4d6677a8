//! Operator settings, optionally loaded from a TOML file.
//!
//! ```toml
//! fine_increment = 50
//! coarse_increment = 500
//! led_brightness = 0.33
//! output_dir = "/home/pi/timelapses"
//! default_duration = "30m"
//! default_frequency = "5s"
//!
//! [camera]
//! mock = false
//! index = 0
//! width = 1280
//! height = 720
//! fourcc = "YUYV"
//! exposure = 10
//! white_balance = "daylight"
//! warmup_frames = 2
//!
//! [stage]
//! mock = false
//! port = "/dev/ttyUSB0"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::camera::{CameraSettings, WhiteBalance};
use crate::interval::parse_time_value;
use crate::traits::{Format, FourCC};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "OPENFLEXURE_TIMELAPSE_CONFIG";
/// Settings file looked up in the working directory when the variable is unset.
pub const DEFAULT_CONFIG_FILE: &str = "openflexure-timelapse.toml";
/// Largest accepted capture width or height, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File exists but could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        /// Settings file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// File is not valid TOML for these settings.
    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("Invalid setting `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Steps per click of the fine motor buttons.
    pub fine_increment: i32,
    /// Steps per click of the coarse motor buttons.
    pub coarse_increment: i32,
    /// Condenser LED brightness used for preview and capture.
    pub led_brightness: f32,
    /// Directory session folders are created in.
    pub output_dir: PathBuf,
    /// Initial text of the duration field.
    pub default_duration: String,
    /// Initial text of the frequency field.
    pub default_frequency: String,
    /// Camera settings.
    pub camera: CameraConfig,
    /// Stage settings.
    pub stage: StageConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fine_increment: 50,
            coarse_increment: 500,
            led_brightness: 0.33,
            output_dir: PathBuf::from("."),
            default_duration: "30m".to_owned(),
            default_frequency: "5s".to_owned(),
            camera: CameraConfig::default(),
            stage: StageConfig::default(),
        }
    }
}

/// Camera section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    /// Use the mock camera instead of a V4L2 device.
    pub mock: bool,
    /// V4L2 device index (`/dev/video<index>`).
    pub index: u32,
    /// Capture width in pixels.
    pub width: u32,
    /// Capture height in pixels.
    pub height: u32,
    /// Pixel format: `YUYV`, `MJPG` or `RGB3`.
    pub fourcc: String,
    /// Manual exposure value.
    pub exposure: i64,
    /// White balance preset.
    pub white_balance: WhiteBalance,
    /// Frames discarded before each still.
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let defaults = CameraSettings::default();
        Self {
            mock: false,
            index: 0,
            width: defaults.format.width,
            height: defaults.format.height,
            fourcc: defaults.format.fourcc.to_string(),
            exposure: defaults.exposure,
            white_balance: defaults.white_balance,
            warmup_frames: defaults.warmup_frames,
        }
    }
}

/// Stage section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    /// Use the mock stage instead of a Sangaboard.
    pub mock: bool,
    /// Serial port; scanned for when unset.
    pub port: Option<String>,
}

impl Settings {
    /// Load settings from `$OPENFLEXURE_TIMELAPSE_CONFIG`, or from
    /// `openflexure-timelapse.toml` in the working directory. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    tracing::debug!("no settings file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load and validate settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<()> {
        check_increment("fine_increment", self.fine_increment)?;
        check_increment("coarse_increment", self.coarse_increment)?;
        if !(0.0..=1.0).contains(&self.led_brightness) {
            return Err(invalid("led_brightness", "must be between 0.0 and 1.0"));
        }
        if parse_time_value(&self.default_duration).is_none() {
            return Err(invalid("default_duration", "expected e.g. `1h 30m 10s`"));
        }
        if parse_time_value(&self.default_frequency).is_none() {
            return Err(invalid("default_frequency", "expected e.g. `5s`"));
        }
        self.camera_settings().map(|_| ())
    }

    /// Camera settings derived from the `[camera]` section.
    pub fn camera_settings(&self) -> Result<CameraSettings> {
        let camera = &self.camera;
        let fourcc = FourCC::parse(&camera.fourcc)
            .filter(|f| [FourCC::YUYV, FourCC::MJPG, FourCC::RGB3].contains(f))
            .ok_or_else(|| invalid("camera.fourcc", "must be YUYV, MJPG or RGB3"))?;
        if camera.width == 0 || camera.height == 0 {
            return Err(invalid("camera.width", "capture size must be non-zero"));
        }
        if camera.width > MAX_DIMENSION || camera.height > MAX_DIMENSION {
            return Err(ConfigError::Invalid {
                field: "camera.width",
                reason: format!("capture size must be at most {MAX_DIMENSION}x{MAX_DIMENSION}"),
            });
        }
        // YUYV packs pixels in pairs sharing one U/V sample.
        if fourcc == FourCC::YUYV && camera.width % 2 != 0 {
            return Err(invalid("camera.width", "YUYV capture width must be even"));
        }
        Ok(CameraSettings {
            exposure: camera.exposure,
            white_balance: camera.white_balance,
            format: Format::new(camera.width, camera.height, fourcc),
            warmup_frames: camera.warmup_frames,
        })
    }
}

fn check_increment(field: &'static str, value: i32) -> Result<()> {
    if value < 1 {
        return Err(invalid(field, "must be at least 1"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

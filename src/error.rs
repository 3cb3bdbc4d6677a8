//! Application-wide error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::stage::StageError;
use crate::timelapse::TimelapseError;
use crate::traits::CameraError;

/// Any failure the GUI may have to report.
#[derive(Debug, Error)]
pub enum AppError {
    /// Camera failure.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    /// Sangaboard failure.
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
    /// Timelapse failure.
    #[error("{0}")]
    Timelapse(#[from] TimelapseError),
    /// Settings file failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Background task failure.
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Result type alias using `AppError`.
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Dialog title for this error.
    pub const fn title(&self) -> &'static str {
        match self {
            Self::Camera(_) => "Camera error",
            Self::Stage(_) => "Stage error",
            Self::Timelapse(_) => "Error",
            Self::Config(_) => "Configuration error",
            Self::Task(_) => "Internal error",
        }
    }
}

//! OpenFlexure timelapse controller.
//!
//! Drives an OpenFlexure microscope: a V4L2 camera for stills and a
//! Sangaboard for stage moves and the condenser LED, with a desktop GUI for
//! jogging the stage and running timelapse captures.

pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod gui;
pub mod hardware;
pub mod interval;
pub mod mock;
pub mod stage;
pub mod timelapse;
pub mod traits;

pub use camera::{Camera, CameraSettings, StillCamera, WhiteBalance};
pub use config::Settings;
pub use device::V4L2Device;
pub use error::{AppError, AppResult};
pub use hardware::{Hardware, HardwareWorker};
pub use stage::{Sangaboard, Stage};
pub use timelapse::{Timelapse, TimelapsePlan};
pub use traits::{
    CameraDevice, CaptureStream, DeviceCapabilities, Format, FourCC, Frame, FrameMetadata,
};

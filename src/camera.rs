//! Still capture on top of a V4L2 camera device.
//!
//! [`StillCamera`] wraps any [`CameraDevice`], applies the microscope's
//! exposure and white balance, and turns single frames into RGB images that
//! are written to disk as JPEG.

use std::path::Path;

use image::{ImageFormat, RgbImage};
use serde::Deserialize;

use crate::traits::{CameraDevice, CameraError, CaptureStream, Format, FourCC, Frame, Result};

/// `V4L2_CID_EXPOSURE_AUTO`
pub const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
/// `V4L2_CID_EXPOSURE_ABSOLUTE`
pub const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
/// `V4L2_CID_AUTO_N_PRESET_WHITE_BALANCE`
pub const CID_WHITE_BALANCE_PRESET: u32 = 0x009a_0914;

/// `V4L2_EXPOSURE_MANUAL`
const EXPOSURE_MANUAL: i64 = 1;

const STREAM_BUFFERS: u32 = 4;

/// White balance presets understood by V4L2 drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteBalance {
    /// Manual white balance.
    Manual,
    /// Automatic white balance.
    Auto,
    /// Incandescent light.
    Incandescent,
    /// Fluorescent light.
    Fluorescent,
    /// High-frequency fluorescent light.
    FluorescentH,
    /// Horizon light.
    Horizon,
    /// Daylight.
    #[default]
    Daylight,
    /// Camera flash.
    Flash,
    /// Cloudy daylight.
    Cloudy,
    /// Shade.
    Shade,
}

impl WhiteBalance {
    /// Value of the `enum v4l2_auto_n_preset_white_balance` preset.
    pub const fn preset(self) -> i64 {
        match self {
            Self::Manual => 0,
            Self::Auto => 1,
            Self::Incandescent => 2,
            Self::Fluorescent => 3,
            Self::FluorescentH => 4,
            Self::Horizon => 5,
            Self::Daylight => 6,
            Self::Flash => 7,
            Self::Cloudy => 8,
            Self::Shade => 9,
        }
    }
}

/// Still capture configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    /// Manual exposure value, in the driver's units.
    pub exposure: i64,
    /// White balance preset.
    pub white_balance: WhiteBalance,
    /// Requested capture format.
    pub format: Format,
    /// Frames discarded before each still while auto-gain settles.
    pub warmup_frames: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure: 10,
            white_balance: WhiteBalance::Daylight,
            format: Format::new(1280, 720, FourCC::YUYV),
            warmup_frames: 2,
        }
    }
}

/// Object-safe camera interface used by the timelapse and the GUI.
pub trait Camera: Send {
    /// Capture one still as an RGB image.
    fn capture(&mut self) -> Result<RgbImage>;

    /// Capture one still and write it to `path` as JPEG.
    fn take_photo(&mut self, path: &Path) -> Result<RgbImage> {
        let image = self.capture()?;
        image.save_with_format(path, ImageFormat::Jpeg)?;
        Ok(image)
    }

    /// Enter live preview mode.
    fn start_preview(&mut self);

    /// Leave live preview mode.
    fn stop_preview(&mut self);

    /// Whether live preview is active.
    fn is_previewing(&self) -> bool;

    /// Grab a preview frame, or `None` when preview is off.
    fn preview_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Human-readable description of the device.
    fn describe(&self) -> String;
}

/// Still camera over a V4L2-style device.
pub struct StillCamera<D: CameraDevice> {
    device: D,
    format: Format,
    warmup_frames: u32,
    previewing: bool,
}

impl<D: CameraDevice> StillCamera<D> {
    /// Configure `device` for still capture.
    ///
    /// The format must be accepted; exposure and white balance controls the
    /// driver lacks are skipped with a warning.
    pub fn open(mut device: D, settings: &CameraSettings) -> Result<Self> {
        let format = device.set_format(&settings.format)?;

        apply_control(&mut device, CID_EXPOSURE_AUTO, EXPOSURE_MANUAL);
        apply_control(&mut device, CID_EXPOSURE_ABSOLUTE, settings.exposure);
        apply_control(
            &mut device,
            CID_WHITE_BALANCE_PRESET,
            settings.white_balance.preset(),
        );

        tracing::info!(
            card = %device.capabilities().card,
            format = %format!("{}x{} {}", format.width, format.height, format.fourcc),
            exposure = settings.exposure,
            white_balance = ?settings.white_balance,
            "camera ready"
        );

        Ok(Self {
            device,
            format,
            warmup_frames: settings.warmup_frames,
            previewing: false,
        })
    }

    /// Format negotiated with the driver.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Access the wrapped device.
    pub const fn device(&self) -> &D {
        &self.device
    }

    fn grab(&mut self, warmup: u32) -> Result<RgbImage> {
        let format = self.format.clone();
        let mut stream = self.device.create_stream(STREAM_BUFFERS)?;
        for _ in 0..warmup {
            stream.next_frame()?;
        }
        let frame = stream.next_frame()?;
        drop(stream);
        frame.to_rgb(&format)
    }
}

impl<D> Camera for StillCamera<D>
where
    D: CameraDevice + Send,
{
    fn capture(&mut self) -> Result<RgbImage> {
        self.grab(self.warmup_frames)
    }

    fn start_preview(&mut self) {
        self.previewing = true;
    }

    fn stop_preview(&mut self) {
        self.previewing = false;
    }

    fn is_previewing(&self) -> bool {
        self.previewing
    }

    fn preview_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.previewing {
            return Ok(None);
        }
        self.grab(0).map(Some)
    }

    fn describe(&self) -> String {
        let caps = self.device.capabilities();
        format!("{} ({})", caps.card, caps.driver)
    }
}

fn apply_control<D: CameraDevice>(device: &mut D, id: u32, value: i64) {
    if let Err(err) = device.set_control(id, value) {
        tracing::warn!("skipping camera control: {err}");
    }
}

/// Decode a raw frame into an RGB image.
pub fn decode_frame(frame: &Frame, format: &Format) -> Result<RgbImage> {
    let data = frame.payload();
    let (width, height) = (format.width, format.height);

    let pixels = match format.fourcc {
        FourCC::MJPG => {
            return Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8());
        }
        FourCC::YUYV => {
            let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
            for row in rows(data, format, 2)? {
                for macropixel in row.chunks_exact(4) {
                    if let [y0, u, y1, v] = *macropixel {
                        let (r, g, b) = crate::traits::yuv_to_rgb(y0, u, v);
                        rgb.extend_from_slice(&[r, g, b]);
                        let (r, g, b) = crate::traits::yuv_to_rgb(y1, u, v);
                        rgb.extend_from_slice(&[r, g, b]);
                    }
                }
            }
            rgb
        }
        FourCC::RGB3 => rows(data, format, 3)?.flatten().copied().collect(),
        _ => return Err(CameraError::FormatNotSupported(format.clone())),
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| CameraError::StreamError("frame buffer size mismatch".to_owned()))
}

/// Split packed frame data into rows of exactly `width * bpp` bytes.
fn rows<'a>(
    data: &'a [u8],
    format: &Format,
    bytes_per_pixel: u32,
) -> Result<impl Iterator<Item = &'a [u8]>> {
    let row_len = (format.width as usize).saturating_mul(bytes_per_pixel as usize);
    let stride = (format.stride as usize).max(row_len);
    let needed = stride
        .saturating_mul((format.height as usize).saturating_sub(1))
        .saturating_add(row_len);
    if format.height == 0 || data.len() < needed {
        return Err(CameraError::StreamError(format!(
            "short frame: {} bytes, expected {needed}",
            data.len()
        )));
    }
    Ok(data
        .chunks(stride)
        .take(format.height as usize)
        .filter_map(move |row| row.get(..row_len)))
}

/// Shrink an image to fit within `max_width` x `max_height`, keeping the
/// aspect ratio with the short side rounded to the nearest pixel. Images that
/// already fit are returned unchanged.
pub fn thumbnail(image: &RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= max_width && height <= max_height {
        return image.clone();
    }

    let (w, h) = (u64::from(width), u64::from(height));
    let (mw, mh) = (u64::from(max_width), u64::from(max_height));
    let (new_w, new_h) = if w * mh > h * mw {
        (mw, (h * mw + w / 2) / w)
    } else {
        ((w * mh + h / 2) / h, mh)
    };

    #[allow(clippy::cast_possible_truncation)]
    image::imageops::thumbnail(image, (new_w as u32).max(1), (new_h as u32).max(1))
}

//! Mock hardware for running without a microscope attached.
//!
//! Used by the unit tests and as the runtime fallback when no camera or
//! Sangaboard can be opened.

use crate::stage::{Stage, StageError};
use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC, Frame,
    FrameMetadata, Result,
};
use std::time::Duration;

/// Mock camera device producing synthetic YUYV frames.
#[derive(Debug)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    frame_count: u32,
    pattern: TestPattern,
    controls: Vec<(u32, i64)>,
    rejected_controls: Vec<u32>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            frame_count: 0,
            pattern: TestPattern::ColorBars,
            controls: Vec::new(),
            rejected_controls: Vec::new(),
        }
    }

    /// Set the test pattern every stream of this device produces.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make the device reject a control, as drivers without it do.
    #[must_use]
    pub fn rejecting_control(mut self, id: u32) -> Self {
        self.rejected_controls.push(id);
        self
    }

    /// Controls applied so far, in order.
    pub fn controls(&self) -> &[(u32, i64)] {
        &self.controls
    }

    /// Number of frames generated so far.
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }
}

impl CameraDevice for MockDevice {
    type Stream<'a> = MockStream<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        if format.fourcc != FourCC::YUYV || format.width == 0 || format.height == 0 {
            return Err(CameraError::FormatNotSupported(format.clone()));
        }
        self.format = format.clone();
        Ok(self.format.clone())
    }

    fn create_stream(&mut self, _buffer_count: u32) -> Result<Self::Stream<'_>> {
        let pattern = self.pattern;
        Ok(MockStream {
            device: self,
            pattern,
        })
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        if self.rejected_controls.contains(&id) {
            return Err(CameraError::ControlRejected {
                id,
                reason: "not supported by mock".to_owned(),
            });
        }
        tracing::info!(id = format!("{id:#x}"), value, "[mock] camera control set");
        self.controls.push((id, value));
        Ok(())
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock capture stream.
pub struct MockStream<'a> {
    device: &'a mut MockDevice,
    pattern: TestPattern,
}

impl CaptureStream for MockStream<'_> {
    fn next_frame(&mut self) -> Result<Frame> {
        let format = &self.device.format;
        let data = generate_test_frame(format, self.pattern);

        let seq = self.device.frame_count;
        self.device.frame_count += 1;

        Ok(Frame {
            data,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33),
                bytes_used: format.size,
            },
        })
    }
}

/// YUYV values of the 8 colour bars: White, Yellow, Cyan, Green, Magenta,
/// Red, Blue, Black.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Generate YUYV frame data for a pattern.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let width = format.width.max(2);
    let size = (width as usize)
        .saturating_mul(format.height as usize)
        .saturating_mul(2);
    let mut data = vec![0u8; size];

    let bar_width = (width / 8).max(1);

    for row in data.chunks_exact_mut((width * 2) as usize) {
        for (pair, macropixel) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = pair as u32 * 2;
            let (y_val, u_val, v_val) = match pattern {
                TestPattern::ColorBars => {
                    let bar = (x / bar_width).min(7) as usize;
                    BARS.get(bar).copied().unwrap_or((16, 128, 128))
                }
                TestPattern::Gradient => {
                    #[allow(clippy::cast_possible_truncation)]
                    let y_val = ((x * 255) / width) as u8;
                    (y_val, 128, 128)
                }
                TestPattern::Solid(y, u, v) => (y, u, v),
            };
            macropixel.copy_from_slice(&[y_val, u_val, y_val, v_val]);
        }
    }

    data
}

/// Mock stage recording every command it receives.
#[derive(Debug, Default)]
pub struct MockStage {
    moves: Vec<[i32; 3]>,
    led_history: Vec<f32>,
    led: f32,
    closed: bool,
    fail_moves: bool,
}

impl MockStage {
    /// Create a mock stage with the LED off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent move fail, as an unplugged board would.
    #[must_use]
    pub const fn failing_moves(mut self) -> Self {
        self.fail_moves = true;
        self
    }

    /// Relative moves received so far.
    pub fn moves(&self) -> &[[i32; 3]] {
        &self.moves
    }

    /// Every LED brightness written, in order.
    pub fn led_history(&self) -> &[f32] {
        &self.led_history
    }

    /// Whether `close` has been called.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Stage for MockStage {
    fn move_rel(&mut self, displacement: [i32; 3]) -> std::result::Result<(), StageError> {
        if self.closed {
            return Err(StageError::Closed);
        }
        if self.fail_moves {
            return Err(StageError::UnexpectedReply {
                command: "mrr".to_owned(),
                reply: "mock failure".to_owned(),
            });
        }
        tracing::info!(?displacement, "[mock] move_rel");
        self.moves.push(displacement);
        Ok(())
    }

    fn set_led(&mut self, brightness: f32) -> std::result::Result<(), StageError> {
        if self.closed {
            return Err(StageError::Closed);
        }
        let brightness = brightness.clamp(0.0, 1.0);
        tracing::info!(brightness, "[mock] LED brightness set");
        self.led = brightness;
        self.led_history.push(brightness);
        Ok(())
    }

    fn led(&self) -> f32 {
        self.led
    }

    fn close(&mut self) -> std::result::Result<(), StageError> {
        if !self.closed {
            tracing::info!("[mock] stage closed");
            self.led = 0.0;
            self.closed = true;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock stage".to_owned()
    }
}

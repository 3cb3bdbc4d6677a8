//! Timelapse session: plan validation, output folder and per-tick capture.
//!
//! The session does not own a timer. The caller decides when to call
//! [`Timelapse::tick`]; each tick either captures one frame or reports that
//! the end time has been reached.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use image::RgbImage;
use thiserror::Error;

use crate::camera::Camera;
use crate::interval::parse_time_value;
use crate::stage::{Stage, StageError};
use crate::traits::CameraError;

/// Folder and file name format, local time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Error type for timelapse operations.
#[derive(Debug, Error)]
pub enum TimelapseError {
    /// Duration or interval missing, malformed or zero.
    #[error("Invalid duration or frequency")]
    InvalidPlan,
    /// Operation requires a running session.
    #[error("Timelapse is not running")]
    NotRunning,
    /// Session already started.
    #[error("Timelapse already started")]
    AlreadyStarted,
    /// Session folder could not be created.
    #[error("Failed to create {}: {source}", .path.display())]
    Folder {
        /// Folder path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Camera failure during capture.
    #[error(transparent)]
    Camera(#[from] CameraError),
    /// Stage failure while switching the LED.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Result type for timelapse operations.
pub type Result<T> = std::result::Result<T, TimelapseError>;

/// How long to run and how often to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelapsePlan {
    /// Total length of the session.
    pub duration: Duration,
    /// Delay between the end of one capture and the start of the next.
    pub interval: Duration,
}

impl TimelapsePlan {
    /// Build a plan; both durations must be non-zero.
    pub fn new(duration: Duration, interval: Duration) -> Result<Self> {
        if duration.is_zero() || interval.is_zero() {
            return Err(TimelapseError::InvalidPlan);
        }
        Ok(Self { duration, interval })
    }

    /// Build a plan from text such as `30m` and `5s`.
    pub fn parse(duration: &str, interval: &str) -> Result<Self> {
        let duration = parse_time_value(duration).ok_or(TimelapseError::InvalidPlan)?;
        let interval = parse_time_value(interval).ok_or(TimelapseError::InvalidPlan)?;
        Self::new(duration, interval)
    }

    /// Upper bound on frames if captures took no time.
    pub fn max_frames(&self) -> u64 {
        let interval = self.interval.as_millis().max(1);
        u64::try_from(self.duration.as_millis().div_ceil(interval)).unwrap_or(u64::MAX)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimelapseState {
    /// Not started yet.
    #[default]
    Idle,
    /// Capturing.
    Running,
    /// Reached its end time.
    Finished,
    /// Stopped early by the operator.
    Stopped,
}

/// A frame written during a tick.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// JPEG file written.
    pub path: PathBuf,
    /// Decoded image, for display.
    pub image: RgbImage,
    /// 1-based frame number within the session.
    pub number: u64,
}

/// Result of a tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// A frame was captured.
    Captured(CapturedFrame),
    /// The end time was reached; no frame was captured.
    Finished,
}

/// A timelapse capture session.
#[derive(Debug)]
pub struct Timelapse {
    plan: TimelapsePlan,
    state: TimelapseState,
    folder: Option<PathBuf>,
    ends_at: Option<DateTime<Local>>,
    frames: u64,
}

impl Timelapse {
    /// Create an idle session for `plan`.
    pub const fn new(plan: TimelapsePlan) -> Self {
        Self {
            plan,
            state: TimelapseState::Idle,
            folder: None,
            ends_at: None,
            frames: 0,
        }
    }

    /// Create the session folder under `output_root` and start running.
    pub fn start(&mut self, output_root: &Path, now: DateTime<Local>) -> Result<&Path> {
        if self.state != TimelapseState::Idle {
            return Err(TimelapseError::AlreadyStarted);
        }

        let span = TimeDelta::from_std(self.plan.duration)
            .map_err(|_| TimelapseError::InvalidPlan)?;
        let ends_at = now
            .checked_add_signed(span)
            .ok_or(TimelapseError::InvalidPlan)?;

        let folder = output_root.join(now.format(TIMESTAMP_FORMAT).to_string());
        std::fs::create_dir_all(&folder).map_err(|source| TimelapseError::Folder {
            path: folder.clone(),
            source,
        })?;

        tracing::info!(
            folder = %folder.display(),
            duration = ?self.plan.duration,
            interval = ?self.plan.interval,
            "timelapse started"
        );

        self.ends_at = Some(ends_at);
        self.state = TimelapseState::Running;
        Ok(self.folder.insert(folder).as_path())
    }

    /// Capture one frame, or finish if `now` is past the end time.
    ///
    /// The LED is lit at `brightness` only for the duration of the capture
    /// and is switched off again even when the capture fails.
    pub fn tick(
        &mut self,
        now: DateTime<Local>,
        camera: &mut dyn Camera,
        stage: &mut dyn Stage,
        brightness: f32,
    ) -> Result<TickOutcome> {
        if self.state != TimelapseState::Running {
            return Err(TimelapseError::NotRunning);
        }
        let (Some(folder), Some(ends_at)) = (&self.folder, self.ends_at) else {
            return Err(TimelapseError::NotRunning);
        };

        if now >= ends_at {
            self.state = TimelapseState::Finished;
            tracing::info!(frames = self.frames, "timelapse complete");
            return Ok(TickOutcome::Finished);
        }

        let path = frame_path(folder, now);

        stage.set_led(brightness)?;
        let captured = camera.take_photo(&path);
        let led_off = stage.set_led(0.0);
        let image = captured?;
        led_off?;

        self.frames += 1;
        tracing::info!("Captured: {}", path.display());

        Ok(TickOutcome::Captured(CapturedFrame {
            path,
            image,
            number: self.frames,
        }))
    }

    /// End the session early.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != TimelapseState::Running {
            return Err(TimelapseError::NotRunning);
        }
        self.state = TimelapseState::Stopped;
        tracing::info!(frames = self.frames, "timelapse stopped early");
        Ok(())
    }

    /// The plan this session runs.
    pub const fn plan(&self) -> &TimelapsePlan {
        &self.plan
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> TimelapseState {
        self.state
    }

    /// Whether the session is capturing.
    pub fn is_running(&self) -> bool {
        self.state == TimelapseState::Running
    }

    /// Session folder, once started.
    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// End time, once started.
    pub const fn ends_at(&self) -> Option<DateTime<Local>> {
        self.ends_at
    }

    /// Frames captured so far.
    pub const fn frames(&self) -> u64 {
        self.frames
    }
}

/// Path for a frame taken at `now`, suffixed when the second is taken.
fn frame_path(folder: &Path, now: DateTime<Local>) -> PathBuf {
    let stamp = now.format(TIMESTAMP_FORMAT).to_string();
    let mut path = folder.join(format!("{stamp}.jpg"));
    let mut n = 1;
    while path.exists() {
        path = folder.join(format!("{stamp}_{n}.jpg"));
        n += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, StillCamera};
    use crate::mock::{MockDevice, MockStage};
    use crate::traits::{Format, FourCC};
    use chrono::TimeZone;

    fn at(hour: u32, min: u32, sec: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, 1, hour, min, sec)
            .single()
            .expect("unambiguous local time")
    }

    fn camera() -> StillCamera<MockDevice> {
        let settings = CameraSettings {
            format: Format::new(32, 24, FourCC::YUYV),
            ..CameraSettings::default()
        };
        StillCamera::open(MockDevice::new(), &settings).expect("mock camera")
    }

    fn plan(duration: u64, interval: u64) -> TimelapsePlan {
        TimelapsePlan::new(Duration::from_secs(duration), Duration::from_secs(interval))
            .expect("valid plan")
    }

    #[test]
    fn test_plan_parse() {
        let plan = TimelapsePlan::parse("30m", "5s").expect("valid");
        assert_eq!(plan.duration, Duration::from_secs(1800));
        assert_eq!(plan.interval, Duration::from_secs(5));
        assert_eq!(plan.max_frames(), 360);
    }

    #[test]
    fn test_plan_rejects_zero_and_garbage() {
        assert!(matches!(
            TimelapsePlan::parse("0s", "5s"),
            Err(TimelapseError::InvalidPlan)
        ));
        assert!(matches!(
            TimelapsePlan::parse("30m", ""),
            Err(TimelapseError::InvalidPlan)
        ));
        assert!(matches!(
            TimelapsePlan::parse("soon", "5s"),
            Err(TimelapseError::InvalidPlan)
        ));
    }

    #[test]
    fn test_start_creates_timestamped_folder() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(60, 5));

        let folder = session
            .start(root.path(), at(12, 0, 0))
            .expect("start")
            .to_path_buf();

        assert_eq!(folder, root.path().join("2024-05-01_12-00-00"));
        assert!(folder.is_dir());
        assert_eq!(session.ends_at(), Some(at(12, 1, 0)));
        assert!(matches!(
            session.start(root.path(), at(12, 0, 1)),
            Err(TimelapseError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_tick_captures_with_led_pulse() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(60, 5));
        session.start(root.path(), at(12, 0, 0)).expect("start");
        let (mut camera, mut stage) = (camera(), MockStage::new());

        let outcome = session
            .tick(at(12, 0, 0), &mut camera, &mut stage, 0.33)
            .expect("tick");

        let frame = match outcome {
            TickOutcome::Captured(frame) => frame,
            TickOutcome::Finished => unreachable!("session should still be running"),
        };
        assert_eq!(frame.number, 1);
        assert!(frame.path.ends_with("2024-05-01_12-00-00/2024-05-01_12-00-00.jpg"));
        assert!(frame.path.is_file());
        assert_eq!(stage.led_history(), &[0.33, 0.0]);
    }

    #[test]
    fn test_same_second_does_not_overwrite() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(60, 1));
        session.start(root.path(), at(12, 0, 0)).expect("start");
        let (mut camera, mut stage) = (camera(), MockStage::new());

        for _ in 0..2 {
            session
                .tick(at(12, 0, 5), &mut camera, &mut stage, 0.5)
                .expect("tick");
        }

        let folder = session.folder().expect("folder");
        assert!(folder.join("2024-05-01_12-00-05.jpg").is_file());
        assert!(folder.join("2024-05-01_12-00-05_1.jpg").is_file());
        assert_eq!(session.frames(), 2);
    }

    #[test]
    fn test_finishes_at_end_time() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(10, 5));
        session.start(root.path(), at(12, 0, 0)).expect("start");
        let (mut camera, mut stage) = (camera(), MockStage::new());

        let outcome = session
            .tick(at(12, 0, 10), &mut camera, &mut stage, 0.5)
            .expect("tick");

        assert!(matches!(outcome, TickOutcome::Finished));
        assert_eq!(session.state(), TimelapseState::Finished);
        assert!(stage.led_history().is_empty());
        assert!(matches!(
            session.tick(at(12, 0, 11), &mut camera, &mut stage, 0.5),
            Err(TimelapseError::NotRunning)
        ));
    }

    #[test]
    fn test_stop_early_rejects_further_ticks() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(600, 5));
        session.start(root.path(), at(12, 0, 0)).expect("start");
        session.stop().expect("stop");

        let (mut camera, mut stage) = (camera(), MockStage::new());
        assert_eq!(session.state(), TimelapseState::Stopped);
        assert!(matches!(
            session.tick(at(12, 0, 1), &mut camera, &mut stage, 0.5),
            Err(TimelapseError::NotRunning)
        ));
        assert!(session.stop().is_err());
    }

    #[test]
    fn test_tick_before_start_is_rejected() {
        let mut session = Timelapse::new(plan(60, 5));
        let (mut camera, mut stage) = (camera(), MockStage::new());
        assert!(matches!(
            session.tick(at(12, 0, 0), &mut camera, &mut stage, 0.5),
            Err(TimelapseError::NotRunning)
        ));
    }

    #[test]
    fn test_led_failure_aborts_tick() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut session = Timelapse::new(plan(60, 5));
        session.start(root.path(), at(12, 0, 0)).expect("start");
        let mut camera = camera();
        let mut stage = MockStage::new();
        stage.close().expect("close");

        let result = session.tick(at(12, 0, 1), &mut camera, &mut stage, 0.5);
        assert!(matches!(result, Err(TimelapseError::Stage(StageError::Closed))));
        assert_eq!(session.frames(), 0);
    }
}

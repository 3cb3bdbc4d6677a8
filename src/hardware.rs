//! The microscope's hardware: one camera and one stage.
//!
//! Each device falls back to its mock when the real one cannot be opened, so
//! the controller stays usable on a desk without a microscope attached. The
//! reasons are returned so the GUI can tell the operator.
//!
//! [`HardwareWorker`] owns a dedicated thread that runs hardware jobs one at
//! a time, in the order they were submitted.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::camera::{Camera, CameraSettings, StillCamera};
use crate::config::Settings;
use crate::device::V4L2Device;
use crate::error::{AppError, AppResult};
use crate::mock::{MockDevice, MockStage};
use crate::stage::{Sangaboard, Stage};
use crate::traits::{Format, FourCC};

/// Hardware shared between the GUI and background capture tasks.
pub type SharedHardware = Arc<Mutex<Hardware>>;

/// An open camera and stage.
pub struct Hardware {
    /// Still camera.
    pub camera: Box<dyn Camera>,
    /// Motor stage with condenser LED.
    pub stage: Box<dyn Stage>,
}

impl Hardware {
    /// Open the configured hardware, falling back to mocks.
    ///
    /// Returns the hardware together with the errors that forced a fallback.
    /// Fails only if even the mock camera cannot be configured.
    pub fn open(settings: &Settings) -> AppResult<(Self, Vec<AppError>)> {
        let mut fallbacks = Vec::new();

        let stage = if settings.stage.mock {
            Box::new(MockStage::new()) as Box<dyn Stage>
        } else {
            match open_stage(settings.stage.port.as_deref()) {
                Ok(stage) => stage,
                Err(err) => {
                    tracing::warn!("using mock stage: {err}");
                    fallbacks.push(err);
                    Box::new(MockStage::new())
                }
            }
        };

        let camera = match settings.camera_settings() {
            Err(err) => {
                fallbacks.push(err.into());
                mock_camera(&CameraSettings::default())?
            }
            Ok(camera_settings) if settings.camera.mock => mock_camera(&camera_settings)?,
            Ok(camera_settings) => {
                match open_camera(settings.camera.index, &camera_settings) {
                    Ok(camera) => camera,
                    Err(err) => {
                        tracing::warn!("using mock camera: {err}");
                        fallbacks.push(err);
                        mock_camera(&camera_settings)?
                    }
                }
            }
        };

        let mut hardware = Self { camera, stage };
        if let Err(err) = hardware.stage.set_led(0.0) {
            tracing::warn!("could not switch the LED off: {err}");
            fallbacks.push(err.into());
        }

        tracing::info!(
            camera = %hardware.camera.describe(),
            stage = %hardware.stage.describe(),
            "hardware ready"
        );
        Ok((hardware, fallbacks))
    }

    /// Hardware made entirely of mocks.
    pub fn mock() -> AppResult<Self> {
        Ok(Self {
            camera: mock_camera(&CameraSettings::default())?,
            stage: Box::new(MockStage::new()),
        })
    }

    /// Wrap for sharing with background tasks.
    pub fn shared(self) -> SharedHardware {
        Arc::new(Mutex::new(self))
    }

    /// Borrow camera and stage together.
    pub fn parts(&mut self) -> (&mut dyn Camera, &mut dyn Stage) {
        (self.camera.as_mut(), self.stage.as_mut())
    }

    /// Stop any preview, switch the LED off and close the stage.
    ///
    /// Errors are logged; shutdown always completes.
    pub fn shutdown(&mut self) {
        let (camera, stage) = self.parts();
        shutdown_devices(camera, stage);
    }
}

pub(crate) fn shutdown_devices(camera: &mut dyn Camera, stage: &mut dyn Stage) {
    camera.stop_preview();
    if let Err(err) = stage.set_led(0.0) {
        tracing::warn!("could not switch the LED off: {err}");
    }
    if let Err(err) = stage.close() {
        tracing::warn!("could not close the stage: {err}");
    }
    tracing::info!("hardware shut down");
}

type Job = Box<dyn FnOnce(&mut Hardware) + Send>;

/// Serialises hardware access on one thread.
///
/// Jobs run in submission order, so an LED write queued before a preview
/// toggle always lands before it. The thread exits once every handle is
/// dropped.
#[derive(Clone)]
pub struct HardwareWorker {
    jobs: mpsc::UnboundedSender<Job>,
}

impl HardwareWorker {
    /// Start the worker thread for `hardware`.
    pub fn spawn(hardware: SharedHardware) -> AppResult<Self> {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("hardware".to_owned())
            .spawn(move || {
                while let Some(job) = queue.blocking_recv() {
                    let mut guard = hardware.lock();
                    job(&mut guard);
                }
                tracing::debug!("hardware worker stopped");
            })
            .map_err(|err| AppError::Task(format!("could not start hardware worker: {err}")))?;
        Ok(Self { jobs })
    }

    /// Queue `job` and resolve with its result once it has run.
    pub fn run<T, F>(&self, job: F) -> impl Future<Output = AppResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut Hardware) -> AppResult<T> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let queued = self
            .jobs
            .send(Box::new(move |hardware: &mut Hardware| {
                if reply.send(job(hardware)).is_err() {
                    tracing::debug!("hardware job finished after its caller went away");
                }
            }))
            .is_ok();

        async move {
            if !queued {
                return Err(worker_stopped());
            }
            result.await.map_err(|_| worker_stopped())?
        }
    }
}

fn worker_stopped() -> AppError {
    AppError::Task("hardware worker stopped".to_owned())
}

fn open_stage(port: Option<&str>) -> AppResult<Box<dyn Stage>> {
    let board = match port {
        Some(port) => Sangaboard::open(port)?,
        None => Sangaboard::detect()?,
    };
    Ok(Box::new(board))
}

fn open_camera(index: u32, settings: &CameraSettings) -> AppResult<Box<dyn Camera>> {
    let device = V4L2Device::open(index)?;
    Ok(Box::new(StillCamera::open(device, settings)?))
}

/// Mock camera matching the configured size; the mock only produces YUYV.
fn mock_camera(settings: &CameraSettings) -> AppResult<Box<dyn Camera>> {
    let settings = CameraSettings {
        format: Format::new(
            settings.format.width.max(2),
            settings.format.height.max(1),
            FourCC::YUYV,
        ),
        ..settings.clone()
    };
    Ok(Box::new(StillCamera::open(MockDevice::new(), &settings)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_settings() -> Settings {
        let mut settings = Settings::default();
        settings.camera.mock = true;
        settings.camera.width = 64;
        settings.camera.height = 48;
        settings.stage.mock = true;
        settings
    }

    #[test]
    fn test_open_mock_hardware_has_no_fallbacks() {
        let (mut hardware, fallbacks) = Hardware::open(&mock_settings()).expect("open");
        assert!(fallbacks.is_empty());
        assert_eq!(hardware.stage.led(), 0.0);
        assert_eq!(hardware.camera.capture().expect("capture").dimensions(), (64, 48));
    }

    #[test]
    fn test_mock_camera_ignores_compressed_format() {
        let mut settings = mock_settings();
        settings.camera.fourcc = "MJPG".to_owned();
        let (mut hardware, fallbacks) = Hardware::open(&settings).expect("open");
        assert!(fallbacks.is_empty());
        assert!(hardware.camera.capture().is_ok());
    }

    #[test]
    fn test_missing_serial_port_falls_back_to_mock_stage() {
        let mut settings = mock_settings();
        settings.stage.mock = false;
        settings.stage.port = Some("/dev/does-not-exist-openflexure".to_owned());

        let (mut hardware, fallbacks) = Hardware::open(&settings).expect("open");

        assert_eq!(fallbacks.len(), 1);
        assert!(matches!(fallbacks.first(), Some(AppError::Stage(_))));
        assert_eq!(hardware.stage.describe(), "mock stage");
        hardware.stage.move_rel([1, 0, 0]).expect("mock move");
    }

    #[test]
    fn test_shutdown_switches_led_off_and_closes_stage() {
        let mut camera = mock_camera(&CameraSettings::default()).expect("camera");
        let mut stage = MockStage::new();
        stage.set_led(0.5).expect("led");
        camera.start_preview();

        shutdown_devices(camera.as_mut(), &mut stage);

        assert!(!camera.is_previewing());
        assert_eq!(stage.led_history(), &[0.5, 0.0]);
        assert!(stage.is_closed());
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_in_submission_order() {
        let shared = Hardware::mock().expect("mock").shared();
        let worker = HardwareWorker::spawn(Arc::clone(&shared)).expect("worker");

        let first = worker.run(|hw| Ok(hw.stage.set_led(0.8)?));
        let second = worker.run(|hw| Ok(hw.stage.set_led(0.2)?));
        let third = worker.run(|hw| Ok(hw.stage.led()));

        // Awaiting out of order does not change the order jobs ran in.
        assert!((third.await.expect("led") - 0.2).abs() < f32::EPSILON);
        first.await.expect("first");
        second.await.expect("second");
    }

    #[tokio::test]
    async fn test_worker_reports_job_errors() {
        let worker = HardwareWorker::spawn(Hardware::mock().expect("mock").shared())
            .expect("worker");
        worker
            .run(|hw| Ok(hw.stage.close()?))
            .await
            .expect("close");
        let moved = worker.run(|hw| Ok(hw.stage.move_rel([1, 0, 0])?)).await;
        assert!(matches!(moved, Err(AppError::Stage(_))));
    }

    #[test]
    fn test_shutdown_closes_stage() {
        let shared = Hardware::mock().expect("mock").shared();
        {
            let mut hardware = shared.lock();
            hardware.camera.start_preview();
            hardware.shutdown();
            assert!(!hardware.camera.is_previewing());
        }
        let mut hardware = shared.lock();
        assert!(hardware.stage.move_rel([1, 0, 0]).is_err());
    }
}

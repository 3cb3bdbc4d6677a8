//! Desktop front-end built on iced.
//!
//! All hardware access goes through the [`HardwareWorker`] so long moves and
//! exposures never stall the event loop, and jobs reach the hardware in the
//! order the operator triggered them. Timelapse ticks are chained: the next
//! tick is scheduled one interval after the previous capture finished.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use iced::widget::image::Handle;
use iced::widget::{
    button, column, container, row, scrollable, slider, text, text_input, Column, Row,
};
use iced::{window, Alignment, Element, Length, Size, Subscription, Task};
use image::RgbImage;
use parking_lot::Mutex;

use crate::camera::{thumbnail, Camera};
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::hardware::{Hardware, HardwareWorker};
use crate::interval::format_duration;
use crate::stage::{scaled, Stage, AXES};
use crate::timelapse::{TickOutcome, Timelapse, TimelapsePlan};

const TITLE: &str = "OpenFlexure Timelapse Controller";
const THUMBNAIL_SIZE: (u32, u32) = (380, 280);
const PREVIEW_PERIOD: Duration = Duration::from_millis(250);

/// Launch the GUI and block until the window is closed.
pub fn run(settings: Settings, worker: HardwareWorker, notices: Vec<String>) -> iced::Result {
    iced::application(TITLE, App::update, App::view)
        .subscription(App::subscription)
        .window(window::Settings {
            size: Size::new(460.0, 960.0),
            exit_on_close_request: false,
            ..window::Settings::default()
        })
        .run_with(move || App::new(settings, worker, notices))
}

/// Events handled by the GUI.
#[derive(Debug, Clone)]
pub enum Message {
    /// Motor button pressed.
    Move([i32; 3]),
    /// Move finished.
    Moved(Result<(), Failure>),
    /// Open the increments editor.
    EditIncrements,
    /// Coarse increment text edited.
    CoarseInput(String),
    /// Fine increment text edited.
    FineInput(String),
    /// Apply edited increments.
    ApplyIncrements,
    /// Discard edited increments.
    CancelIncrements,
    /// LED slider moved.
    LedChanged(f32),
    /// LED write finished; carries whether the LED was written.
    LedApplied(Result<bool, Failure>),
    /// Preview button pressed.
    TogglePreview,
    /// Preview switched; carries the new state.
    PreviewToggled(Result<bool, Failure>),
    /// Time to refresh the preview.
    PreviewTick,
    /// Preview frame grabbed.
    PreviewFrame(Result<Option<Handle>, Failure>),
    /// Duration text edited.
    DurationChanged(String),
    /// Frequency text edited.
    FrequencyChanged(String),
    /// Start button pressed.
    StartTimelapse,
    /// Stop button pressed.
    StopTimelapse,
    /// Time for the next capture of run `id`.
    Tick(u64),
    /// Capture of run `id` finished.
    Ticked(u64, Result<TickReport, Failure>),
    /// Session marked stopped on the worker.
    SessionStopped(Result<(), Failure>),
    /// Dialog acknowledged.
    DismissDialog,
    /// Window close button pressed.
    CloseRequested,
    /// Hardware shut down; safe to exit.
    ShutDown,
}

/// What a background tick produced.
#[derive(Debug, Clone)]
pub enum TickReport {
    /// Frame written.
    Captured {
        /// File written.
        path: std::path::PathBuf,
        /// Frame number within the session.
        number: u64,
        /// Thumbnail for display.
        thumbnail: Handle,
    },
    /// End time reached.
    Finished,
}

/// A hardware job failure, ready for a dialog.
#[derive(Debug, Clone)]
pub struct Failure {
    title: &'static str,
    message: String,
}

impl From<AppError> for Failure {
    fn from(err: AppError) -> Self {
        Self {
            title: err.title(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug)]
struct Dialog {
    title: String,
    message: String,
}

#[derive(Debug, Default)]
struct IncrementEditor {
    coarse: String,
    fine: String,
}

struct Progress {
    frames: u64,
    max_frames: u64,
    ends_at: DateTime<Local>,
    interval: Duration,
}

struct App {
    worker: HardwareWorker,
    settings: Settings,
    fine_increment: i32,
    coarse_increment: i32,
    increment_editor: Option<IncrementEditor>,
    led_brightness: f32,
    previewing: bool,
    preview_in_flight: bool,
    last_image: Option<Handle>,
    duration_text: String,
    frequency_text: String,
    session: Option<Arc<Mutex<Timelapse>>>,
    progress: Option<Progress>,
    run_id: u64,
    status: String,
    dialog: Option<Dialog>,
    closing: bool,
}

impl App {
    fn new(
        settings: Settings,
        worker: HardwareWorker,
        notices: Vec<String>,
    ) -> (Self, Task<Message>) {
        let dialog = (!notices.is_empty()).then(|| Dialog {
            title: "Hardware not found".to_owned(),
            message: format!("{}\n\nUsing simulated hardware instead.", notices.join("\n")),
        });

        let app = Self {
            worker,
            fine_increment: settings.fine_increment,
            coarse_increment: settings.coarse_increment,
            increment_editor: None,
            led_brightness: settings.led_brightness,
            previewing: false,
            preview_in_flight: false,
            last_image: None,
            duration_text: settings.default_duration.clone(),
            frequency_text: settings.default_frequency.clone(),
            session: None,
            progress: None,
            run_id: 0,
            status: "Ready".to_owned(),
            dialog,
            closing: false,
            settings,
        };
        (app, Task::none())
    }

    const fn running(&self) -> bool {
        self.session.is_some()
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::Move(displacement) => {
                if self.running() {
                    return Task::none();
                }
                tracing::debug!(?displacement, "move requested");
                Task::perform(
                    self.on_hardware(move |hw| Ok(hw.stage.move_rel(displacement)?)),
                    Message::Moved,
                )
            }
            Message::Moved(result) => {
                self.report(result);
                Task::none()
            }
            Message::EditIncrements => {
                self.increment_editor = Some(IncrementEditor {
                    coarse: self.coarse_increment.to_string(),
                    fine: self.fine_increment.to_string(),
                });
                Task::none()
            }
            Message::CoarseInput(value) => {
                if let Some(editor) = &mut self.increment_editor {
                    editor.coarse = value;
                }
                Task::none()
            }
            Message::FineInput(value) => {
                if let Some(editor) = &mut self.increment_editor {
                    editor.fine = value;
                }
                Task::none()
            }
            Message::ApplyIncrements => {
                if let Some(editor) = &self.increment_editor {
                    match (parse_increment(&editor.coarse), parse_increment(&editor.fine)) {
                        (Some(coarse), Some(fine)) => {
                            self.coarse_increment = coarse;
                            self.fine_increment = fine;
                            self.increment_editor = None;
                            tracing::info!(coarse, fine, "motor increments changed");
                        }
                        _ => self.show_error(
                            "Error",
                            "Increments must be whole numbers of at least 1",
                        ),
                    }
                }
                Task::none()
            }
            Message::CancelIncrements => {
                self.increment_editor = None;
                Task::none()
            }
            Message::LedChanged(value) => {
                if self.running() {
                    return Task::none();
                }
                self.led_brightness = value;
                if !self.previewing {
                    return Task::none();
                }
                Task::perform(
                    self.on_hardware(move |hw| {
                        let (camera, stage) = hw.parts();
                        apply_led(camera, stage, value)
                    }),
                    Message::LedApplied,
                )
            }
            Message::LedApplied(result) => {
                match result {
                    Ok(written) => tracing::debug!(written, "LED update"),
                    Err(err) => self.show_failure(&err),
                }
                Task::none()
            }
            Message::TogglePreview => {
                if self.running() {
                    return Task::none();
                }
                let brightness = self.led_brightness;
                let enable = !self.previewing;
                Task::perform(
                    self.on_hardware(move |hw| {
                        let (camera, stage) = hw.parts();
                        switch_preview(camera, stage, enable, brightness)
                    }),
                    Message::PreviewToggled,
                )
            }
            Message::PreviewToggled(result) => {
                match result {
                    Ok(previewing) => self.previewing = previewing,
                    Err(err) => self.show_failure(&err),
                }
                Task::none()
            }
            Message::PreviewTick => {
                if !self.previewing || self.preview_in_flight {
                    return Task::none();
                }
                self.preview_in_flight = true;
                Task::perform(
                    self.on_hardware(|hw| {
                        Ok(hw.camera.preview_frame()?.map(|image| to_handle(&image)))
                    }),
                    Message::PreviewFrame,
                )
            }
            Message::PreviewFrame(result) => {
                self.preview_in_flight = false;
                match result {
                    Ok(Some(handle)) if self.previewing => self.last_image = Some(handle),
                    Ok(_) => {}
                    Err(err) => {
                        self.show_failure(&err);
                        return self.update(Message::TogglePreview);
                    }
                }
                Task::none()
            }
            Message::DurationChanged(value) => {
                self.duration_text = value;
                Task::none()
            }
            Message::FrequencyChanged(value) => {
                self.frequency_text = value;
                Task::none()
            }
            Message::StartTimelapse => self.start_timelapse(),
            Message::StopTimelapse => {
                if !self.running() {
                    return Task::none();
                }
                let stop = self.stop_session();
                self.finish("Stopped", "Timelapse stopped early");
                stop
            }
            Message::Tick(id) => self.tick(id),
            Message::Ticked(id, result) => self.ticked(id, result),
            Message::SessionStopped(result) => {
                if let Err(err) = result {
                    tracing::debug!("stop after session ended: {}", err.message);
                }
                Task::none()
            }
            Message::DismissDialog => {
                self.dialog = None;
                Task::none()
            }
            Message::CloseRequested => {
                if self.closing {
                    return Task::none();
                }
                self.closing = true;
                tracing::info!("window closed, shutting down");
                let session = self.session.take();
                self.run_id += 1;
                Task::perform(
                    self.on_hardware(move |hw| {
                        if let Some(session) = session {
                            stop_logged(&session);
                        }
                        hw.shutdown();
                        Ok(())
                    }),
                    |_| Message::ShutDown,
                )
            }
            Message::ShutDown => iced::exit(),
        }
    }

    /// Run `job` on the hardware worker.
    fn on_hardware<T, F>(&self, job: F) -> impl Future<Output = Result<T, Failure>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Hardware) -> AppResult<T> + Send + 'static,
    {
        let job = self.worker.run(job);
        async move { job.await.map_err(Failure::from) }
    }

    /// Mark the session stopped once any in-flight capture has finished.
    fn stop_session(&mut self) -> Task<Message> {
        let Some(session) = self.session.take() else {
            return Task::none();
        };
        Task::perform(
            self.on_hardware(move |_| Ok(session.lock().stop()?)),
            Message::SessionStopped,
        )
    }

    fn start_timelapse(&mut self) -> Task<Message> {
        if self.running() {
            return Task::none();
        }

        let plan = match TimelapsePlan::parse(&self.duration_text, &self.frequency_text) {
            Ok(plan) => plan,
            Err(err) => {
                self.show_error("Error", &err.to_string());
                return Task::none();
            }
        };

        // The first capture switches an active preview off on the worker.
        self.previewing = false;

        let mut session = Timelapse::new(plan);
        let ends_at = match session.start(&self.settings.output_dir, Local::now()) {
            Ok(folder) => {
                self.status = format!("Saving to {}", folder.display());
                session.ends_at()
            }
            Err(err) => {
                self.show_error("Error", &err.to_string());
                return Task::none();
            }
        };

        self.increment_editor = None;
        self.session = Some(Arc::new(Mutex::new(session)));
        self.progress = ends_at.map(|ends_at| Progress {
            frames: 0,
            max_frames: plan.max_frames(),
            ends_at,
            interval: plan.interval,
        });
        self.run_id += 1;
        Task::done(Message::Tick(self.run_id))
    }

    fn tick(&self, id: u64) -> Task<Message> {
        let Some(session) = self.session.as_ref().filter(|_| id == self.run_id) else {
            return Task::none();
        };
        let session = Arc::clone(session);
        let brightness = self.led_brightness;

        Task::perform(
            self.on_hardware(move |hw| {
                let (camera, stage) = hw.parts();
                capture_step(&session, camera, stage, brightness)
            }),
            move |result| Message::Ticked(id, result),
        )
    }

    fn ticked(&mut self, id: u64, result: Result<TickReport, Failure>) -> Task<Message> {
        if id != self.run_id || !self.running() {
            return Task::none();
        }

        match result {
            Ok(TickReport::Captured {
                path,
                number,
                thumbnail,
            }) => {
                self.last_image = Some(thumbnail);
                self.status = format!("Captured: {}", path.display());
                let Some(progress) = self.progress.as_mut() else {
                    return Task::none();
                };
                progress.frames = number;
                Task::perform(tokio::time::sleep(progress.interval), move |()| {
                    Message::Tick(id)
                })
            }
            Ok(TickReport::Finished) => {
                self.session = None;
                self.finish("Done", "Timelapse complete");
                Task::none()
            }
            Err(err) => {
                let stop = self.stop_session();
                self.finish(err.title, &format!("Timelapse aborted: {}", err.message));
                stop
            }
        }
    }

    /// Re-enable the controls after a session ended.
    fn finish(&mut self, title: &str, message: &str) {
        self.run_id += 1;
        self.progress = None;
        self.status = message.to_owned();
        self.dialog = Some(Dialog {
            title: title.to_owned(),
            message: message.to_owned(),
        });
    }

    fn report(&mut self, result: Result<(), Failure>) {
        if let Err(err) = result {
            self.show_failure(&err);
        }
    }

    fn show_failure(&mut self, failure: &Failure) {
        self.show_error(failure.title, &failure.message);
    }

    fn show_error(&mut self, title: &str, message: &str) {
        tracing::error!("{message}");
        self.dialog = Some(Dialog {
            title: title.to_owned(),
            message: message.to_owned(),
        });
    }

    fn subscription(&self) -> Subscription<Message> {
        let close = window::close_requests().map(|_| Message::CloseRequested);
        if self.previewing {
            Subscription::batch([
                close,
                iced::time::every(PREVIEW_PERIOD).map(|_| Message::PreviewTick),
            ])
        } else {
            close
        }
    }

    fn view(&self) -> Element<'_, Message> {
        if let Some(dialog) = &self.dialog {
            return dialog_view(dialog);
        }

        let enabled = !self.running();

        let content = column![
            motor_frame("Coarse", self.coarse_increment, enabled),
            motor_frame("Fine", self.fine_increment, enabled),
            self.increments_view(enabled),
            self.led_view(enabled),
            button(text(if self.previewing {
                "Stop Preview"
            } else {
                "Show Preview"
            }))
            .on_press_maybe(enabled.then_some(Message::TogglePreview)),
            self.image_view(),
            self.timelapse_view(enabled),
            text(self.status_line()).size(14),
        ]
        .spacing(10)
        .padding(10)
        .align_x(Alignment::Center);

        scrollable(content).into()
    }

    fn increments_view(&self, enabled: bool) -> Element<'_, Message> {
        match &self.increment_editor {
            Some(editor) if enabled => container(
                column![
                    row![
                        text("Coarse increment:"),
                        text_input("500", &editor.coarse).on_input(Message::CoarseInput),
                    ]
                    .spacing(5)
                    .align_y(Alignment::Center),
                    row![
                        text("Fine increment:"),
                        text_input("50", &editor.fine).on_input(Message::FineInput),
                    ]
                    .spacing(5)
                    .align_y(Alignment::Center),
                    row![
                        button("Apply").on_press(Message::ApplyIncrements),
                        button("Cancel").on_press(Message::CancelIncrements),
                    ]
                    .spacing(10),
                ]
                .spacing(5),
            )
            .padding(10)
            .style(container::bordered_box)
            .into(),
            _ => button("Change increments")
                .on_press_maybe(enabled.then_some(Message::EditIncrements))
                .into(),
        }
    }

    fn led_view(&self, enabled: bool) -> Element<'_, Message> {
        let control: Element<'_, Message> = if enabled {
            slider(0.0..=1.0, self.led_brightness, Message::LedChanged)
                .step(0.01)
                .into()
        } else {
            text("locked during timelapse").size(12).into()
        };

        container(
            column![
                text(format!("LED Brightness: {:.2}", self.led_brightness)),
                control,
            ]
            .spacing(5),
        )
        .padding(10)
        .width(Length::Fixed(400.0))
        .style(container::bordered_box)
        .into()
    }

    fn image_view(&self) -> Element<'_, Message> {
        let body: Element<'_, Message> = match &self.last_image {
            Some(handle) => iced::widget::image(handle.clone()).into(),
            None => text("No images yet").into(),
        };

        container(column![text("Last Captured Image"), body].spacing(5))
            .padding(10)
            .center_x(Length::Fixed(400.0))
            .height(Length::Fixed(320.0))
            .style(container::bordered_box)
            .into()
    }

    fn timelapse_view(&self, enabled: bool) -> Element<'_, Message> {
        let settings = container(
            column![
                text("e.g. 1h 30m 10s").size(12),
                row![
                    text("Duration:").width(Length::Fixed(90.0)),
                    text_input("30m", &self.duration_text)
                        .on_input_maybe(enabled.then_some(Message::DurationChanged)),
                ]
                .align_y(Alignment::Center),
                row![
                    text("Frequency:").width(Length::Fixed(90.0)),
                    text_input("5s", &self.frequency_text)
                        .on_input_maybe(enabled.then_some(Message::FrequencyChanged)),
                ]
                .align_y(Alignment::Center),
            ]
            .spacing(5),
        )
        .padding(10)
        .width(Length::Fixed(400.0))
        .style(container::bordered_box);

        let action = if enabled {
            button("Confirm settings and start timelapse").on_press(Message::StartTimelapse)
        } else {
            button("Stop and end timelapse early").on_press(Message::StopTimelapse)
        };

        column![text("Timelapse Settings"), settings, action]
            .spacing(5)
            .align_x(Alignment::Center)
            .into()
    }

    fn status_line(&self) -> String {
        match &self.progress {
            Some(progress) => format!(
                "{} | frames: {} of at most {} | every {} | ends {}",
                self.status,
                progress.frames,
                progress.max_frames,
                format_duration(progress.interval),
                progress.ends_at.format("%H:%M:%S")
            ),
            None => self.status.clone(),
        }
    }
}

fn motor_frame(title: &str, increment: i32, enabled: bool) -> Element<'static, Message> {
    let grid = Column::with_children(AXES.chunks(3).map(|chunk| {
        Row::with_children(chunk.iter().map(|(label, direction)| {
            button(text(*label))
                .width(Length::Fixed(60.0))
                .on_press_maybe(enabled.then_some(Message::Move(scaled(*direction, increment))))
                .into()
        }))
        .spacing(5)
        .into()
    }))
    .spacing(5);

    container(
        column![
            text(format!("{title} Motor Control (inc: {increment})")),
            grid
        ]
        .spacing(5)
        .align_x(Alignment::Center),
    )
    .padding(10)
    .width(Length::Fixed(400.0))
    .style(container::bordered_box)
    .into()
}

fn dialog_view(dialog: &Dialog) -> Element<'_, Message> {
    let card = container(
        column![
            text(dialog.title.as_str()).size(20),
            text(dialog.message.as_str()),
            button("OK").on_press(Message::DismissDialog),
        ]
        .spacing(15)
        .align_x(Alignment::Center),
    )
    .padding(20)
    .max_width(400.0)
    .style(container::bordered_box);

    container(card).center(Length::Fill).into()
}

/// Switch the live preview on or off; the LED follows it.
fn switch_preview(
    camera: &mut dyn Camera,
    stage: &mut dyn Stage,
    enable: bool,
    brightness: f32,
) -> AppResult<bool> {
    if enable {
        stage.set_led(brightness)?;
        camera.start_preview();
    } else {
        camera.stop_preview();
        stage.set_led(0.0)?;
    }
    Ok(enable)
}

/// Write `brightness` to the LED, but only while the preview is showing.
fn apply_led(camera: &dyn Camera, stage: &mut dyn Stage, brightness: f32) -> AppResult<bool> {
    if !camera.is_previewing() {
        return Ok(false);
    }
    stage.set_led(brightness)?;
    Ok(true)
}

/// One timelapse step. An active preview is switched off first.
fn capture_step(
    session: &Mutex<Timelapse>,
    camera: &mut dyn Camera,
    stage: &mut dyn Stage,
    brightness: f32,
) -> AppResult<TickReport> {
    if camera.is_previewing() {
        switch_preview(camera, stage, false, brightness)?;
    }
    let outcome = session
        .lock()
        .tick(Local::now(), camera, stage, brightness)?;
    Ok(match outcome {
        TickOutcome::Finished => TickReport::Finished,
        TickOutcome::Captured(frame) => TickReport::Captured {
            thumbnail: to_handle(&frame.image),
            path: frame.path,
            number: frame.number,
        },
    })
}

fn stop_logged(session: &Mutex<Timelapse>) {
    if let Err(err) = session.lock().stop() {
        tracing::debug!("stop after session ended: {err}");
    }
}

fn parse_increment(text: &str) -> Option<i32> {
    text.trim().parse().ok().filter(|value| *value >= 1)
}

fn to_handle(image: &RgbImage) -> Handle {
    let (max_width, max_height) = THUMBNAIL_SIZE;
    let thumb = thumbnail(image, max_width, max_height);
    let (width, height) = thumb.dimensions();
    let rgba: Vec<u8> = thumb
        .pixels()
        .flat_map(|pixel| {
            let [r, g, b] = pixel.0;
            [r, g, b, u8::MAX]
        })
        .collect();
    Handle::from_rgba(width, height, rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, StillCamera};
    use crate::mock::{MockDevice, MockStage};
    use crate::traits::{Format, FourCC};

    fn worker() -> HardwareWorker {
        HardwareWorker::spawn(Hardware::mock().expect("mock hardware").shared())
            .expect("worker")
    }

    fn app(output: &tempfile::TempDir) -> App {
        let settings = Settings {
            output_dir: output.path().to_path_buf(),
            ..Settings::default()
        };
        App::new(settings, worker(), Vec::new()).0
    }

    fn small_camera() -> StillCamera<MockDevice> {
        let settings = CameraSettings {
            format: Format::new(32, 24, FourCC::YUYV),
            ..CameraSettings::default()
        };
        StillCamera::open(MockDevice::new(), &settings).expect("camera")
    }

    fn running_session(output: &tempfile::TempDir) -> Mutex<Timelapse> {
        let plan = TimelapsePlan::new(Duration::from_secs(60), Duration::from_secs(5))
            .expect("plan");
        let mut session = Timelapse::new(plan);
        session.start(output.path(), Local::now()).expect("start");
        Mutex::new(session)
    }

    #[test]
    fn test_parse_increment() {
        assert_eq!(parse_increment(" 250 "), Some(250));
        assert_eq!(parse_increment("0"), None);
        assert_eq!(parse_increment("-5"), None);
        assert_eq!(parse_increment("ten"), None);
    }

    #[test]
    fn test_hardware_notices_open_a_dialog() {
        let (app, _) = App::new(
            Settings::default(),
            worker(),
            vec!["No Sangaboard found on any serial port".to_owned()],
        );
        let dialog = app.dialog.expect("dialog");
        assert_eq!(dialog.title, "Hardware not found");
        assert!(dialog.message.contains("Sangaboard"));
    }

    #[test]
    fn test_apply_increments_validates_input() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let _ = app.update(Message::EditIncrements);
        let _ = app.update(Message::CoarseInput("1000".to_owned()));
        let _ = app.update(Message::FineInput("0".to_owned()));
        let _ = app.update(Message::ApplyIncrements);
        assert_eq!(app.coarse_increment, 500);
        assert!(app.dialog.is_some());
        assert!(app.increment_editor.is_some());

        let _ = app.update(Message::DismissDialog);
        let _ = app.update(Message::FineInput("25".to_owned()));
        let _ = app.update(Message::ApplyIncrements);
        assert_eq!((app.coarse_increment, app.fine_increment), (1000, 25));
        assert!(app.increment_editor.is_none());
    }

    #[test]
    fn test_invalid_plan_shows_error_and_stays_idle() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let _ = app.update(Message::DurationChanged("0s".to_owned()));
        let _ = app.update(Message::StartTimelapse);
        assert!(!app.running());
        let dialog = app.dialog.expect("dialog");
        assert_eq!(dialog.message, "Invalid duration or frequency");
    }

    #[test]
    fn test_start_then_stop_resets_controls() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let _ = app.update(Message::StartTimelapse);
        assert!(app.running());
        let first_run = app.run_id;

        // Controls are ignored while running.
        let _ = app.update(Message::LedChanged(0.9));
        assert!((app.led_brightness - 0.33).abs() < f32::EPSILON);

        let _ = app.update(Message::StopTimelapse);
        assert!(!app.running());
        assert_ne!(app.run_id, first_run);
        assert_eq!(
            app.dialog.as_ref().map(|d| d.message.as_str()),
            Some("Timelapse stopped early")
        );

        // A capture finishing after the stop is discarded.
        let _ = app.update(Message::Ticked(first_run, Ok(TickReport::Finished)));
        assert_eq!(app.status, "Timelapse stopped early");
    }

    #[test]
    fn test_finished_tick_reports_completion() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let _ = app.update(Message::StartTimelapse);
        let id = app.run_id;
        let _ = app.update(Message::Ticked(id, Ok(TickReport::Finished)));
        assert!(!app.running());
        assert_eq!(
            app.dialog.as_ref().map(|d| d.title.as_str()),
            Some("Done")
        );
    }

    #[test]
    fn test_failed_capture_aborts_with_error_title() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let _ = app.update(Message::StartTimelapse);
        let id = app.run_id;
        let failure = Failure::from(AppError::Task("camera went away".to_owned()));
        let _ = app.update(Message::Ticked(id, Err(failure)));
        assert!(!app.running());
        let dialog = app.dialog.expect("dialog");
        assert_eq!(dialog.title, "Internal error");
        assert!(dialog.message.contains("camera went away"));
    }

    #[test]
    fn test_failed_move_shows_stage_error() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        let mut stage = MockStage::new().failing_moves();
        let err = stage.move_rel([50, 0, 0]).expect_err("unplugged board");

        let _ = app.update(Message::Moved(Err(Failure::from(AppError::from(err)))));

        let dialog = app.dialog.expect("dialog");
        assert_eq!(dialog.title, "Stage error");
        assert!(stage.moves().is_empty());
    }

    #[test]
    fn test_led_applied_only_while_previewing() {
        let camera = small_camera();
        let mut stage = MockStage::new();

        assert!(!apply_led(&camera, &mut stage, 0.7).expect("led"));
        assert!(stage.led_history().is_empty());

        let mut camera = camera;
        camera.start_preview();
        assert!(apply_led(&camera, &mut stage, 0.7).expect("led"));
        assert_eq!(stage.led_history(), &[0.7]);
    }

    #[test]
    fn test_preview_switches_led_with_it() {
        let mut camera = small_camera();
        let mut stage = MockStage::new();

        assert!(switch_preview(&mut camera, &mut stage, true, 0.33).expect("on"));
        assert!(camera.is_previewing());
        assert!(!switch_preview(&mut camera, &mut stage, false, 0.33).expect("off"));
        assert!(!camera.is_previewing());

        assert_eq!(stage.led_history(), &[0.33, 0.0]);
        // A late LED write from the slider is dropped once preview is off.
        assert!(!apply_led(&camera, &mut stage, 0.9).expect("led"));
        assert_eq!(stage.led(), 0.0);
    }

    #[test]
    fn test_capture_step_stops_active_preview() {
        let output = tempfile::tempdir().expect("tempdir");
        let session = running_session(&output);
        let mut camera = small_camera();
        let mut stage = MockStage::new();
        switch_preview(&mut camera, &mut stage, true, 0.5).expect("preview");

        let report = capture_step(&session, &mut camera, &mut stage, 0.33).expect("capture");

        assert!(matches!(report, TickReport::Captured { number: 1, .. }));
        assert!(!camera.is_previewing());
        assert_eq!(stage.led_history(), &[0.5, 0.0, 0.33, 0.0]);
    }

    #[test]
    fn test_start_timelapse_clears_preview_flag() {
        let output = tempfile::tempdir().expect("tempdir");
        let mut app = app(&output);
        app.previewing = true;
        let _ = app.update(Message::StartTimelapse);
        assert!(app.running());
        assert!(!app.previewing);
        assert!(app.status_line().contains("frames: 0 of at most 360"));
    }

    #[tokio::test]
    async fn test_close_shuts_hardware_down() {
        let shared = Hardware::mock().expect("mock").shared();
        let worker = HardwareWorker::spawn(Arc::clone(&shared)).expect("worker");
        let output = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            output_dir: output.path().to_path_buf(),
            ..Settings::default()
        };
        let (mut app, _) = App::new(settings, worker, Vec::new());
        let _ = app.update(Message::StartTimelapse);

        let _ = app.update(Message::CloseRequested);
        assert!(app.closing);
        assert!(!app.running());

        // The close job is queued ahead of this one.
        let after_close = app
            .on_hardware(|hw| Ok((hw.stage.led(), hw.stage.move_rel([1, 0, 0]).is_err())))
            .await
            .expect("job");
        assert_eq!(after_close, (0.0, true));
    }

    #[test]
    fn test_thumbnail_handle_fits_display() {
        let image = RgbImage::new(1280, 720);
        // Handle contents are opaque; building one must not panic.
        let _ = to_handle(&image);
    }
}

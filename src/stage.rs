//! Stage and illumination control through a Sangaboard.
//!
//! The Sangaboard firmware speaks a line-based text protocol over USB serial
//! at 115200 baud. Only the handful of commands the timelapse controller
//! needs are issued here: `version` for the handshake, `mrr` for relative
//! moves and `led_cc` for the condenser LED.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Serial baud rate used by the Sangaboard firmware.
pub const BAUD_RATE: u32 = 115_200;

/// Per-read timeout on the serial port; longer waits loop on it.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// The board resets when the port opens and prints a banner.
const BOOT_DELAY: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const LED_TIMEOUT: Duration = Duration::from_secs(2);
const MOVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Unit displacement along each direction of the stage.
pub const AXES: [(&str, [i32; 3]); 6] = [
    ("X+", [1, 0, 0]),
    ("Y+", [0, 1, 0]),
    ("Z+", [0, 0, 1]),
    ("X-", [-1, 0, 0]),
    ("Y-", [0, -1, 0]),
    ("Z-", [0, 0, -1]),
];

/// Scale a unit axis vector by a step increment.
#[must_use]
pub const fn scaled(direction: [i32; 3], increment: i32) -> [i32; 3] {
    let [x, y, z] = direction;
    [x * increment, y * increment, z * increment]
}

/// Error type for stage operations.
#[derive(Debug, Error)]
pub enum StageError {
    /// No serial port answered the handshake.
    #[error("No Sangaboard found on any serial port")]
    NotFound,
    /// The serial port exists but the user may not open it.
    #[error("Permission denied opening {0}; is the user in the dialout group?")]
    PermissionDenied(String),
    /// The serial port could not be opened.
    #[error("Failed to open serial port {port}: {reason}")]
    Open {
        /// Serial port path.
        port: String,
        /// Driver message.
        reason: String,
    },
    /// The board answered something unexpected.
    #[error("Unexpected reply to `{command}`: {reply}")]
    UnexpectedReply {
        /// Command that was sent.
        command: String,
        /// First reply line received.
        reply: String,
    },
    /// No reply arrived in time.
    #[error("Timed out waiting for reply to `{0}`")]
    Timeout(String),
    /// The connection was closed.
    #[error("Stage connection is closed")]
    Closed,
    /// Serial I/O error.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// A motorised stage with a condenser LED.
pub trait Stage: Send {
    /// Move the stage by a relative displacement in motor steps.
    fn move_rel(&mut self, displacement: [i32; 3]) -> Result<()>;

    /// Set the condenser LED brightness, clamped to `0.0..=1.0`.
    fn set_led(&mut self, brightness: f32) -> Result<()>;

    /// Last brightness written to the LED.
    fn led(&self) -> f32;

    /// Switch the LED off and release the connection.
    fn close(&mut self) -> Result<()>;

    /// Human-readable description of the connected device.
    fn describe(&self) -> String;
}

/// Sangaboard client over any byte stream.
pub struct Sangaboard<T: Read + Write + Send> {
    port: Option<BufReader<T>>,
    name: String,
    firmware: String,
    led: f32,
}

impl Sangaboard<Box<dyn serialport::SerialPort>> {
    /// Open the Sangaboard on a serial port such as `/dev/ttyUSB0`.
    pub fn open(path: &str) -> Result<Self> {
        let mut port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| match err.kind() {
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    StageError::PermissionDenied(path.to_owned())
                }
                serialport::ErrorKind::NoDevice => StageError::NotFound,
                _ => StageError::Open {
                    port: path.to_owned(),
                    reason: err.to_string(),
                },
            })?;

        std::thread::sleep(BOOT_DELAY);
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|err| StageError::Open {
                port: path.to_owned(),
                reason: err.to_string(),
            })?;

        Self::connect(port, path)
    }

    /// Scan the serial ports and return the first Sangaboard that answers.
    pub fn detect() -> Result<Self> {
        let ports = serialport::available_ports().map_err(|err| StageError::Open {
            port: "<scan>".to_owned(),
            reason: err.to_string(),
        })?;

        for info in ports {
            match Self::open(&info.port_name) {
                Ok(board) => return Ok(board),
                Err(err @ StageError::PermissionDenied(_)) => {
                    tracing::warn!("{err}");
                }
                Err(err) => {
                    tracing::debug!(port = %info.port_name, "not a Sangaboard: {err}");
                }
            }
        }

        Err(StageError::NotFound)
    }
}

impl<T: Read + Write + Send> Sangaboard<T> {
    /// Perform the version handshake on an already-open stream.
    pub fn connect(port: T, name: &str) -> Result<Self> {
        let mut board = Self {
            port: Some(BufReader::new(port)),
            name: name.to_owned(),
            firmware: String::new(),
            led: 0.0,
        };

        let version = board.query("version", HANDSHAKE_TIMEOUT)?;
        if !version.starts_with("Sangaboard") {
            return Err(StageError::UnexpectedReply {
                command: "version".to_owned(),
                reply: version,
            });
        }
        tracing::info!(port = name, firmware = %version, "connected to Sangaboard");
        board.firmware = version;

        Ok(board)
    }

    /// Firmware version string reported during the handshake.
    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    /// Send one command and return the first non-empty reply line.
    fn query(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let port = self.port.as_mut().ok_or(StageError::Closed)?;

        tracing::trace!(command, "sangaboard <-");
        let stream = port.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        let deadline = Instant::now() + timeout;
        let mut line = String::new();
        loop {
            match port.read_line(&mut line) {
                Ok(0) => return Err(StageError::Closed),
                Ok(_) => {
                    let reply = line.trim();
                    if !reply.is_empty() {
                        tracing::trace!(reply, "sangaboard ->");
                        return Ok(reply.to_owned());
                    }
                    line.clear();
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }
            if Instant::now() >= deadline {
                return Err(StageError::Timeout(command.to_owned()));
            }
        }
    }
}

impl<T: Read + Write + Send> Stage for Sangaboard<T> {
    fn move_rel(&mut self, displacement: [i32; 3]) -> Result<()> {
        let [x, y, z] = displacement;
        let command = format!("mrr {x} {y} {z}");
        let reply = self.query(&command, MOVE_TIMEOUT)?;
        if !reply.starts_with("done") {
            return Err(StageError::UnexpectedReply { command, reply });
        }
        tracing::debug!(x, y, z, "stage moved");
        Ok(())
    }

    fn set_led(&mut self, brightness: f32) -> Result<()> {
        let brightness = brightness.clamp(0.0, 1.0);
        let reply = self.query(&format!("led_cc {brightness}"), LED_TIMEOUT)?;
        tracing::debug!(brightness, reply, "condenser LED set");
        self.led = brightness;
        Ok(())
    }

    fn led(&self) -> f32 {
        self.led
    }

    fn close(&mut self) -> Result<()> {
        if self.port.is_none() {
            return Ok(());
        }
        let result = self.set_led(0.0);
        self.port = None;
        tracing::info!(port = %self.name, "Sangaboard closed");
        result
    }

    fn describe(&self) -> String {
        format!("{} on {}", self.firmware, self.name)
    }
}

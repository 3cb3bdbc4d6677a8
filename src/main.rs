//! Launches the OpenFlexure timelapse controller GUI.

use std::process::ExitCode;

use openflexure_timelapse::{gui, Hardware, HardwareWorker, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openflexure_timelapse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting OpenFlexure timelapse controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(err) = run() {
        tracing::error!("{err}");
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    let (hardware, fallbacks) = Hardware::open(&settings)?;
    let notices = fallbacks.iter().map(ToString::to_string).collect();
    let worker = HardwareWorker::spawn(hardware.shared())?;
    gui::run(settings, worker, notices)?;
    Ok(())
}

//! Integration tests against the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`sudo modprobe vivid`)
//! - Access to /dev/video* devices (may require the video group)
//!
//! Tests fail rather than skip when vivid is missing so CI notices.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use openflexure_timelapse::camera::{Camera, CameraSettings, StillCamera};
use openflexure_timelapse::device::V4L2Device;
use openflexure_timelapse::mock::MockStage;
use openflexure_timelapse::timelapse::{TickOutcome, Timelapse, TimelapsePlan};
use openflexure_timelapse::traits::{CameraDevice, Format, FourCC};
use serial_test::serial;

/// Indices of vivid devices, checked through sysfs before opening.
fn find_vivid_devices() -> Vec<u32> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    (0..10)
        .filter(|index| {
            let name_path = video4linux.join(format!("video{index}")).join("name");
            fs::read_to_string(&name_path)
                .map(|name| name.to_lowercase().contains("vivid"))
                .unwrap_or(false)
        })
        .filter(|index| V4L2Device::open(*index).is_ok())
        .collect()
}

macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().copied() {
            Some(idx) => idx,
            None => panic!(
                "vivid virtual camera not available.\n\
                 Load vivid with: sudo modprobe vivid\n\
                 Or run unit tests only: cargo test --lib"
            ),
        }
    };
}

fn vivid_settings() -> CameraSettings {
    CameraSettings {
        format: Format::new(640, 480, FourCC::YUYV),
        ..CameraSettings::default()
    }
}

fn open_vivid_camera() -> StillCamera<V4L2Device> {
    let index = require_vivid!();
    let device = V4L2Device::open(index).expect("Failed to open vivid device");
    StillCamera::open(device, &vivid_settings()).expect("Failed to configure vivid")
}

#[test]
#[serial]
fn test_vivid_device_capabilities() {
    let index = require_vivid!();
    let device = V4L2Device::open(index).expect("Failed to open vivid device");
    let caps = device.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");
}

#[test]
#[serial]
fn test_vivid_still_capture() {
    let mut camera = open_vivid_camera();
    assert_eq!(camera.format().width, 640);

    let image = camera.capture().expect("Failed to capture still");
    assert_eq!(image.dimensions(), (640, 480));
}

#[test]
#[serial]
fn test_vivid_take_photo_writes_jpeg() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("still.jpg");
    let mut camera = open_vivid_camera();

    camera.take_photo(&path).expect("Failed to take photo");

    let written = image::open(&path).expect("JPEG should decode");
    assert_eq!((written.width(), written.height()), (640, 480));
}

#[test]
#[serial]
fn test_vivid_preview_frames() {
    let mut camera = open_vivid_camera();
    camera.start_preview();
    let frame = camera.preview_frame().expect("Failed to grab preview");
    assert!(frame.is_some(), "preview should yield a frame");
}

#[test]
#[serial]
fn test_vivid_timelapse_two_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut camera = open_vivid_camera();
    let mut stage = MockStage::new();

    let plan = TimelapsePlan::new(Duration::from_secs(60), Duration::from_secs(1))
        .expect("valid plan");
    let mut session = Timelapse::new(plan);
    let start = Local::now();
    session.start(dir.path(), start).expect("start");

    for offset in 0..2 {
        let now = start + TimeDelta::seconds(offset);
        let outcome = session
            .tick(now, &mut camera, &mut stage, 0.33)
            .expect("tick");
        assert!(matches!(outcome, TickOutcome::Captured(_)));
    }

    let folder = session.folder().expect("folder");
    let frames = fs::read_dir(folder).expect("read folder").count();
    assert_eq!(frames, 2);
    assert_eq!(stage.led_history(), &[0.33, 0.0, 0.33, 0.0]);
}

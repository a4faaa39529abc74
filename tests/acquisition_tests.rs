//! End-to-end acquisition against the in-process camera

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use acqview::capture::frame::{FrameFlags, FrameStatus};
use acqview::capture::{BufferState, SimulatedConfig, SimulatedDriver};
use acqview::display::{Bitmap, ChannelRenderer, FrameRenderer, OutputSize};
use acqview::pipeline::display_format;
use acqview::{AcquisitionError, AcquisitionManager, Config};
use crossbeam::channel::{unbounded, Receiver, Sender};

const DEVICE: &str = "DEV_SIM_0";
const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> Config {
    let mut config = Config::default();
    config.acquisition.command_timeout_ms = 200;
    config.display.width = 0;
    config.display.height = 0;
    config
}

fn setup(sim: SimulatedConfig) -> (Arc<SimulatedDriver>, AcquisitionManager, flume::Receiver<Bitmap>) {
    let driver = Arc::new(SimulatedDriver::new(sim));
    let (renderer, rx) = ChannelRenderer::bounded(8);
    let manager = AcquisitionManager::new(driver.clone(), Arc::new(renderer), &config());
    (driver, manager, rx)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < TIMEOUT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn assert_released(driver: &SimulatedDriver) {
    assert_eq!(driver.open_device_count(), 0);
    assert_eq!(driver.announced_count(), 0);
    assert_eq!(driver.unreleased_buffers(), 0);
}

#[test]
fn frames_flow_to_renderer_and_back_into_rotation() {
    let (driver, mut manager, rx) = setup(SimulatedConfig::default());
    manager.start_acquisition(DEVICE).unwrap();
    assert!(driver.is_acquiring());
    assert_eq!(driver.queued_count(), 3);

    assert!(driver.deliver_next());
    let bitmap = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((bitmap.width, bitmap.height), (64, 48));
    assert_eq!(bitmap.format, display_format());
    assert_eq!(bitmap.data.len(), 64 * 48 * 4);

    // converted once, then recycled once
    wait_until("buffer 0 re-enqueued", || driver.enqueue_count(0) == 2);
    assert_eq!(driver.queued_count(), 3);

    manager.stop_acquisition();
    assert!(!driver.is_capturing());
    assert_released(&driver);
}

#[test]
fn output_size_scales_delivered_frames() {
    let (driver, mut manager, rx) = setup(SimulatedConfig::default());
    manager.set_output_size(OutputSize::new(32, 32));
    manager.start_acquisition(DEVICE).unwrap();

    driver.deliver_next();
    let bitmap = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((bitmap.width, bitmap.height), (32, 24));
}

#[test]
fn partial_enqueue_still_starts() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        reject_enqueue: HashSet::from([0, 2]),
        ..SimulatedConfig::default()
    });

    manager.start_acquisition(DEVICE).unwrap();
    assert!(manager.is_acquiring());
    assert_eq!(driver.queued_count(), 1);

    let pool = manager.session().unwrap().pool().unwrap();
    assert_eq!(pool.count_in(BufferState::InFlight), 1);
    assert_eq!(pool.count_in(BufferState::Announced), 2);
}

#[test]
fn no_enqueued_buffer_fails_with_full_rollback() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        reject_enqueue: HashSet::from([0, 1, 2]),
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(matches!(err, AcquisitionError::NoBuffersEnqueued { .. }));
    assert!(err.is_driver_failure());
    assert!(!manager.is_acquiring());
    assert!(!driver.is_capturing());
    assert_released(&driver);
}

#[test]
fn zero_payload_is_a_resource_failure_without_leaks() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        payload_size: Some(0),
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(err.is_resource_failure());
    assert_released(&driver);
}

#[test]
fn announce_failure_revokes_announced_buffers() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        fail_announce_at: Some(2),
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(matches!(
        err,
        AcquisitionError::Driver {
            operation: "announce",
            ..
        }
    ));
    assert_eq!(driver.total_enqueues(), 0);
    assert_released(&driver);
}

#[test]
fn missing_stream_fails_and_closes_device() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        stream_count: 0,
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(matches!(err, AcquisitionError::NoStream));
    assert_released(&driver);
}

#[test]
fn foreign_device_info_is_rejected() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        local_device: false,
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(matches!(err, AcquisitionError::DeviceInfo(_)));
    assert_released(&driver);
}

#[test]
fn failed_acquisition_start_tears_down_capture() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        fail_acquisition_start: true,
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(err.is_driver_failure());
    assert!(!driver.is_capturing());
    assert_released(&driver);
}

#[test]
fn stalled_acquisition_start_times_out() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        stalled_command: Some("AcquisitionStart".into()),
        ..SimulatedConfig::default()
    });

    let err = manager.start_acquisition(DEVICE).unwrap_err();
    assert!(matches!(err, AcquisitionError::Timeout { .. }));
    assert_released(&driver);
}

#[test]
fn failing_acquisition_stop_is_swallowed() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        fail_acquisition_stop: true,
        ..SimulatedConfig::default()
    });

    manager.start_acquisition(DEVICE).unwrap();
    manager.stop_acquisition();
    assert!(!driver.is_capturing());
    assert_released(&driver);
}

#[test]
fn packet_size_adjustment_is_best_effort() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig::default());
    manager.start_acquisition(DEVICE).unwrap();
    assert!(!driver
        .commands_run()
        .iter()
        .any(|c| c == "GVSPAdjustPacketSize"));
    manager.stop_acquisition();

    let (driver, mut manager, _rx) = setup(SimulatedConfig {
        packet_size_command: true,
        ..SimulatedConfig::default()
    });
    manager.start_acquisition(DEVICE).unwrap();
    assert_eq!(
        driver.commands_run(),
        vec!["GVSPAdjustPacketSize".to_string(), "AcquisitionStart".to_string()]
    );
}

#[test]
fn restart_closes_previous_session() {
    let (driver, mut manager, _rx) = setup(SimulatedConfig::default());

    manager.start_acquisition(DEVICE).unwrap();
    let first = manager.session().unwrap().id();
    manager.start_acquisition(DEVICE).unwrap();
    let second = manager.session().unwrap().id();

    assert_ne!(first, second);
    assert_eq!(driver.open_device_count(), 1);
    assert_eq!(driver.announced_count(), 3);
    assert_eq!(driver.unreleased_buffers(), 3);
}

#[test]
fn malformed_frame_is_recycled_without_conversion() {
    let (driver, mut manager, rx) = setup(SimulatedConfig::default());
    manager.start_acquisition(DEVICE).unwrap();

    // no dimension metadata
    assert!(driver.deliver(FrameStatus::Complete, FrameFlags::FRAME_ID));
    assert_eq!(driver.enqueue_count(0), 2);

    assert!(driver.deliver(FrameStatus::Incomplete, FrameFlags::DIMENSION));
    assert_eq!(driver.enqueue_count(1), 2);

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(driver.queued_count(), 3);
}

/// Blocks the transcode worker inside `render` until released
struct GateRenderer {
    entered: Sender<(u32, u32)>,
    release: Receiver<()>,
}

impl FrameRenderer for GateRenderer {
    fn render(&self, bitmap: Bitmap) {
        let _ = self.entered.send((bitmap.width, bitmap.height));
        let _ = self.release.recv();
    }
}

#[test]
fn stop_does_not_recycle_into_closing_session() {
    let driver = Arc::new(SimulatedDriver::new(SimulatedConfig::default()));
    let (entered_tx, entered) = unbounded();
    let (release, release_rx) = unbounded();
    let renderer = GateRenderer {
        entered: entered_tx,
        release: release_rx,
    };
    let mut manager = AcquisitionManager::new(driver.clone(), Arc::new(renderer), &config());
    manager.start_acquisition(DEVICE).unwrap();

    // frame 0 is being rendered, frame 1 waits in the slot
    driver.deliver_next();
    entered.recv_timeout(TIMEOUT).unwrap();
    driver.deliver_next();
    assert_eq!(driver.total_enqueues(), 3);

    let stopper = thread::spawn(move || {
        manager.stop_acquisition();
        manager
    });
    thread::sleep(Duration::from_millis(50));
    release.send(()).unwrap();
    let manager = stopper.join().unwrap();

    assert!(!manager.is_acquiring());
    assert_eq!(driver.total_enqueues(), 3);
    assert_released(&driver);
}

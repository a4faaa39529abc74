//! One open camera with its buffer pool and running acquisition

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::capture::driver::{
    features, CaptureDriver, DeviceHandle, DriverStatus, FrameCallback, Module, StreamHandle,
};
use crate::capture::frame::{FrameBuffer, SessionId};
use crate::capture::pool::FramePool;
use crate::capture::router::{CallbackRouter, FrameHandler};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::transcoder::{DriverRecycler, FramePoster};
use crate::AcquisitionConfig;

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Knobs for opening a session, taken from [`AcquisitionConfig`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub buffer_count: usize,
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    pub adjust_packet_size: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for SessionSettings {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            buffer_count: config.buffer_count.max(1),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            poll_interval: Duration::from_micros(config.command_poll_interval_us.max(1)),
            adjust_packet_size: config.adjust_packet_size,
        }
    }
}

/// Run a device command and wait for the driver to report it done.
///
/// Polls with exponential backoff starting at `poll_interval` and gives up
/// with [`AcquisitionError::Timeout`] once `timeout` has passed.
pub fn run_command(
    driver: &dyn CaptureDriver,
    module: Module,
    command: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    driver
        .run_command(module, command)
        .map_err(|status| AcquisitionError::driver("run_command", status))?;

    let started = Instant::now();
    let mut backoff = poll_interval;
    loop {
        let done = driver
            .is_command_done(module, command)
            .map_err(|status| AcquisitionError::driver("is_command_done", status))?;
        if done {
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= timeout {
            return Err(AcquisitionError::Timeout {
                command: command.to_string(),
                waited,
            });
        }
        thread::sleep(backoff.min(timeout - waited));
        backoff = (backoff * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Routes this session's completed frames into the transcode queue
struct SessionFrames {
    poster: FramePoster,
    recycler: Arc<DriverRecycler>,
}

impl FrameHandler for SessionFrames {
    fn frame_received(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>) {
        self.poster.post_image(stream, buffer, self.recycler.clone());
    }
}

/// An opened camera streaming into a fixed pool of buffers.
///
/// Each completed stage of [`CaptureSession::open`] is recorded in the
/// struct, and dropping the session undoes exactly those stages. A failed
/// open therefore rolls back on its own.
pub struct CaptureSession {
    id: SessionId,
    driver: Arc<dyn CaptureDriver>,
    router: Arc<CallbackRouter>,
    settings: SessionSettings,
    device: Option<DeviceHandle>,
    stream: Option<StreamHandle>,
    pool: Option<FramePool>,
    registered: bool,
    capturing: bool,
    acquiring: bool,
}

impl CaptureSession {
    #[instrument(skip(driver, router, poster, settings))]
    pub fn open(
        driver: Arc<dyn CaptureDriver>,
        router: Arc<CallbackRouter>,
        poster: FramePoster,
        device_id: &str,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let device = driver
            .open_device(device_id)
            .map_err(|status| AcquisitionError::driver("open_device", status))?;

        let mut session = Self {
            id: SessionId::next(),
            driver: Arc::clone(&driver),
            router: Arc::clone(&router),
            settings: settings.clone(),
            device: Some(device),
            stream: None,
            pool: None,
            registered: false,
            capturing: false,
            acquiring: false,
        };

        let info = driver
            .device_info(device)
            .map_err(|status| AcquisitionError::driver("device_info", status))?;
        if !info.local_device {
            return Err(AcquisitionError::DeviceInfo(
                "the id could not be used to query the info of the correct camera".into(),
            ));
        }
        let stream = *info.streams.first().ok_or(AcquisitionError::NoStream)?;
        session.stream = Some(stream);
        info!(model = %info.model, streams = info.streams.len(), "Camera opened");

        if settings.adjust_packet_size {
            session.adjust_packet_size(stream);
        }

        let payload_size = driver
            .payload_size(stream)
            .map_err(|status| AcquisitionError::driver("payload_size", status))?;
        if payload_size == 0 {
            return Err(AcquisitionError::InvalidPayload);
        }

        let alignment = match driver.feature_int(stream.into(), features::STREAM_BUFFER_ALIGNMENT) {
            Ok(alignment) if alignment >= 1 => alignment as usize,
            _ => 1,
        };

        let pool = FramePool::allocate(
            settings.buffer_count,
            payload_size as usize,
            alignment,
            session.id,
        )?;

        // frames may complete as soon as the first buffer is queued
        let callback: Arc<dyn FrameCallback> = router.clone();
        let recycler = Arc::new(DriverRecycler::new(
            Arc::clone(&driver),
            stream,
            Arc::clone(&callback),
        ));
        router.register(session.id, Arc::new(SessionFrames { poster, recycler }));
        session.registered = true;

        let pool = session.pool.insert(pool);
        pool.announce_all(driver.as_ref(), stream)?;

        driver
            .capture_start(stream)
            .map_err(|status| AcquisitionError::driver("capture_start", status))?;
        session.capturing = true;

        let (enqueued, last_error) = pool.enqueue_all(driver.as_ref(), stream, &callback);
        if enqueued == 0 {
            return Err(AcquisitionError::NoBuffersEnqueued {
                status: last_error.unwrap_or(DriverStatus::INVALID_CALL),
            });
        }
        if enqueued < pool.len() {
            warn!(enqueued, total = pool.len(), "Only part of the frame pool was enqueued");
        }

        session.command(device.into(), features::ACQUISITION_START)?;
        session.acquiring = true;

        info!(
            session = session.id.get(),
            payload_size, alignment, enqueued, "Acquisition started"
        );
        Ok(session)
    }

    fn command(&self, module: Module, command: &str) -> Result<()> {
        run_command(
            self.driver.as_ref(),
            module,
            command,
            self.settings.command_timeout,
            self.settings.poll_interval,
        )
    }

    /// GigE cameras can negotiate their packet size; other transports
    /// do not know the command.
    fn adjust_packet_size(&self, stream: StreamHandle) {
        match self.command(stream.into(), features::ADJUST_PACKET_SIZE) {
            Ok(()) => match self.driver.feature_int(stream.into(), features::PACKET_SIZE) {
                Ok(size) => info!(packet_size = size, "Packet size adjusted"),
                Err(status) => debug!(%status, "Adjusted packet size unreadable"),
            },
            Err(e) => debug!("Packet size adjustment skipped: {}", e),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.stream
    }

    pub fn pool(&self) -> Option<&FramePool> {
        self.pool.as_ref()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Stop acquisition and release the camera
    pub fn close(self) {
        drop(self);
    }

    fn teardown(&mut self) {
        if self.acquiring {
            if let Some(device) = self.device {
                if let Err(e) = self.command(device.into(), features::ACQUISITION_STOP) {
                    debug!("Ignoring failed acquisition stop: {}", e);
                }
            }
            self.acquiring = false;
        }

        if let Some(stream) = self.stream {
            if self.capturing {
                if let Err(status) = self.driver.capture_end(stream) {
                    warn!(%status, "Ending capture failed");
                }
                if let Err(status) = self.driver.flush_queue(stream) {
                    warn!(%status, "Flushing capture queue failed");
                }
                if let Some(pool) = &self.pool {
                    pool.mark_flushed();
                }
                self.capturing = false;
            }

            if let Some(pool) = self.pool.take() {
                pool.revoke_all(self.driver.as_ref(), stream);
            }
        }

        if self.registered {
            self.router.unregister(self.id);
            self.registered = false;
        }

        if let Some(device) = self.device.take() {
            match self.driver.close_device(device) {
                Ok(()) => info!(session = self.id.get(), "Camera closed"),
                Err(status) => warn!(%status, "Closing camera failed"),
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimulatedConfig, SimulatedDriver};

    fn settings() -> SessionSettings {
        SessionSettings {
            command_timeout: Duration::from_millis(50),
            ..SessionSettings::default()
        }
    }

    #[test]
    fn run_command_times_out_instead_of_hanging() {
        let driver = SimulatedDriver::new(SimulatedConfig {
            stalled_command: Some(features::ACQUISITION_START.into()),
            ..SimulatedConfig::default()
        });
        let device = driver.open_device("DEV_SIM_0").unwrap();

        let started = Instant::now();
        let err = run_command(
            &driver,
            device.into(),
            features::ACQUISITION_START,
            Duration::from_millis(30),
            Duration::from_micros(100),
        )
        .unwrap_err();

        assert!(matches!(err, AcquisitionError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_command_reports_driver_refusal() {
        let driver = SimulatedDriver::new(SimulatedConfig::default());
        let device = driver.open_device("DEV_SIM_0").unwrap();
        let err = run_command(
            &driver,
            device.into(),
            "NoSuchCommand",
            Duration::from_millis(30),
            Duration::from_micros(100),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Driver {
                operation: "run_command",
                ..
            }
        ));
    }

    #[test]
    fn alignment_falls_back_to_one() {
        for reported in [None, Some(0), Some(-8)] {
            let driver = Arc::new(SimulatedDriver::new(SimulatedConfig {
                alignment: reported,
                ..SimulatedConfig::default()
            }));
            let queue = crate::pipeline::TranscodeQueue::new(
                Arc::new(crate::display::ChannelRenderer::bounded(1).0),
                Default::default(),
            );
            let session = CaptureSession::open(
                driver.clone(),
                Arc::new(CallbackRouter::new()),
                queue.poster(),
                "DEV_SIM_0",
                &settings(),
            )
            .unwrap();

            assert_eq!(session.pool().unwrap().alignment(), 1);
            session.close();
        }
    }
}

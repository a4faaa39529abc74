//! Top-level orchestration of one camera session and the transcode worker

use std::sync::Arc;

use tracing::info;

use crate::capture::driver::CaptureDriver;
use crate::capture::router::CallbackRouter;
use crate::capture::session::{CaptureSession, SessionSettings};
use crate::display::{FrameRenderer, OutputSize};
use crate::error::Result;
use crate::pipeline::transcoder::TranscodeQueue;
use crate::Config;

pub struct AcquisitionManager {
    driver: Arc<dyn CaptureDriver>,
    router: Arc<CallbackRouter>,
    transcoder: TranscodeQueue,
    session: Option<CaptureSession>,
    settings: SessionSettings,
}

impl AcquisitionManager {
    pub fn new(
        driver: Arc<dyn CaptureDriver>,
        renderer: Arc<dyn FrameRenderer>,
        config: &Config,
    ) -> Self {
        let output_size = OutputSize::new(config.display.width, config.display.height);
        Self {
            driver,
            router: Arc::new(CallbackRouter::new()),
            transcoder: TranscodeQueue::new(renderer, output_size),
            session: None,
            settings: SessionSettings::from(&config.acquisition),
        }
    }

    /// Open `device_id` and start streaming into the renderer.
    ///
    /// A running acquisition is stopped first. On failure nothing stays
    /// open and the manager is back to idle.
    pub fn start_acquisition(&mut self, device_id: &str) -> Result<()> {
        self.stop_acquisition();

        // the worker has to be consuming before the first buffer is queued,
        // frames posted to a stopped queue never return to rotation
        self.transcoder.start()?;

        match CaptureSession::open(
            Arc::clone(&self.driver),
            Arc::clone(&self.router),
            self.transcoder.poster(),
            device_id,
            &self.settings,
        ) {
            Ok(session) => {
                info!(session = session.id().get(), device_id, "Acquisition running");
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.transcoder.stop();
                Err(e)
            }
        }
    }

    /// Stop consuming frames, then release the camera. No-op when idle.
    pub fn stop_acquisition(&mut self) {
        self.transcoder.stop();
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    /// Bounds for delivered bitmaps; takes effect with the next frame
    pub fn set_output_size(&self, size: OutputSize) {
        self.transcoder.set_output_size(size);
    }

    pub fn output_size(&self) -> OutputSize {
        self.transcoder.output_size()
    }

    pub fn is_acquiring(&self) -> bool {
        self.session.as_ref().is_some_and(CaptureSession::is_acquiring)
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }
}

impl Drop for AcquisitionManager {
    fn drop(&mut self) {
        self.stop_acquisition();
    }
}

//! Single-slot hand-off from the driver callback thread to the conversion
//! worker
//!
//! The callback thread must never block, so there is no queue: the slot
//! holds at most one frame and a newer frame replaces an older one that
//! the worker has not picked up yet. The replaced frame goes straight back
//! to the driver without being converted.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{debug, info, trace, warn};

use crate::capture::driver::{CaptureDriver, FrameCallback, StreamHandle};
use crate::capture::frame::{BufferState, FrameBuffer};
use crate::capture::pool::enqueue_buffer;
use crate::display::{scale_to_fit, FrameRenderer, OutputSize};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::image::{Image, ImageView};

/// Returns a buffer to the driver's capture queue
pub trait FrameRecycler: Send + Sync {
    fn recycle(&self, buffer: &Arc<FrameBuffer>) -> Result<()>;
}

/// Re-enqueues buffers on the stream they were captured on
pub struct DriverRecycler {
    driver: Arc<dyn CaptureDriver>,
    stream: StreamHandle,
    callback: Arc<dyn FrameCallback>,
}

impl DriverRecycler {
    pub fn new(
        driver: Arc<dyn CaptureDriver>,
        stream: StreamHandle,
        callback: Arc<dyn FrameCallback>,
    ) -> Self {
        Self {
            driver,
            stream,
            callback,
        }
    }
}

impl FrameRecycler for DriverRecycler {
    fn recycle(&self, buffer: &Arc<FrameBuffer>) -> Result<()> {
        enqueue_buffer(
            self.driver.as_ref(),
            self.stream,
            buffer,
            Arc::clone(&self.callback),
        )
    }
}

/// A frame waiting for conversion.
///
/// Dropping a task recycles its buffer unless the task was canceled.
/// Canceled buffers stay pool-owned and are revoked with the session.
pub struct TranscodeTask {
    stream: StreamHandle,
    buffer: Arc<FrameBuffer>,
    recycler: Arc<dyn FrameRecycler>,
    canceled: bool,
}

impl TranscodeTask {
    pub fn new(
        stream: StreamHandle,
        buffer: Arc<FrameBuffer>,
        recycler: Arc<dyn FrameRecycler>,
    ) -> Self {
        Self {
            stream,
            buffer,
            recycler,
            canceled: false,
        }
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }
}

impl Drop for TranscodeTask {
    fn drop(&mut self) {
        if self.canceled {
            trace!(index = self.buffer.index(), "Canceled task left for revoke");
            return;
        }
        if let Err(e) = self.recycler.recycle(&self.buffer) {
            debug!(index = self.buffer.index(), "Recycling frame failed: {}", e);
        }
    }
}

struct Inbox {
    terminated: bool,
    task: Option<TranscodeTask>,
}

struct Shared {
    inbox: Mutex<Inbox>,
    wakeup: Condvar,
    output_size: ArcSwap<OutputSize>,
    renderer: Arc<dyn FrameRenderer>,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(
        &self,
        stream: StreamHandle,
        buffer: &Arc<FrameBuffer>,
        recycler: Arc<dyn FrameRecycler>,
    ) {
        if let Err(e) = buffer.transition(BufferState::Pending) {
            trace!("Frame not taken: {}", e);
            return;
        }

        if !buffer.meta().is_convertible() {
            // hand it straight back, a broken frame must not starve the pool
            metrics::counter!("frames_rejected").increment(1);
            if let Err(e) = recycler.recycle(buffer) {
                trace!(index = buffer.index(), "Re-enqueue of rejected frame failed: {}", e);
            }
            return;
        }

        let mut task = TranscodeTask::new(stream, Arc::clone(buffer), recycler);
        let replaced = {
            let mut inbox = self.inbox();
            if inbox.terminated {
                task.cancel();
                None
            } else {
                Some(inbox.task.replace(task))
            }
        };

        // dropped outside the lock so the re-enqueue never runs under it
        match replaced {
            None => trace!(index = buffer.index(), "Frame arrived while stopped"),
            Some(previous) => {
                if previous.is_some() {
                    metrics::counter!("frames_replaced").increment(1);
                }
                drop(previous);
                self.wakeup.notify_one();
            }
        }
    }

    fn run(&self) {
        let mut target = Image::for_display();
        let mut inbox = self.inbox();

        loop {
            inbox = self
                .wakeup
                .wait_while(inbox, |i| !i.terminated && i.task.is_none())
                .unwrap_or_else(PoisonError::into_inner);

            if inbox.terminated {
                return;
            }
            let Some(mut task) = inbox.task.take() else {
                continue;
            };
            drop(inbox);

            self.transcode(&task, &mut target);

            let terminated = self.inbox().terminated;
            if terminated {
                // the session is closing, its buffers get revoked
                task.cancel();
                return;
            }
            drop(task);

            inbox = self.inbox();
        }
    }

    fn transcode(&self, task: &TranscodeTask, target: &mut Image) {
        let started = Instant::now();
        let buffer = task.buffer();

        let converted = buffer
            .with_payload(|meta, payload| {
                let source = ImageView::from_frame(meta, payload)?;
                target.convert(&source)
            })
            .and_then(|result| result);

        if let Err(e) = converted {
            metrics::counter!("transcode_failures").increment(1);
            warn!(index = buffer.index(), "Frame conversion failed: {}", e);
            return;
        }

        let size = **self.output_size.load();
        match scale_to_fit(target, size) {
            Ok(bitmap) => {
                metrics::histogram!("transcode_time_us")
                    .record(started.elapsed().as_micros() as f64);
                self.renderer.render(bitmap);
            }
            Err(e) => {
                metrics::counter!("transcode_failures").increment(1);
                warn!(index = buffer.index(), "Scaling converted frame failed: {}", e);
            }
        }
    }
}

/// Cloneable posting side of a [`TranscodeQueue`], used from the driver's
/// callback thread
#[derive(Clone)]
pub struct FramePoster {
    shared: Arc<Shared>,
}

impl FramePoster {
    /// Offer a completed frame for conversion.
    ///
    /// Frames that are incomplete or lack dimensions are recycled at once.
    /// Otherwise the frame replaces whatever is pending; the replaced frame
    /// is recycled unconverted. While the queue is stopped the frame is
    /// canceled and left for revoke.
    pub fn post_image(
        &self,
        stream: StreamHandle,
        buffer: &Arc<FrameBuffer>,
        recycler: Arc<dyn FrameRecycler>,
    ) {
        self.shared.post(stream, buffer, recycler);
    }
}

/// Worker thread converting the latest captured frame for display
pub struct TranscodeQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TranscodeQueue {
    pub fn new(renderer: Arc<dyn FrameRenderer>, output_size: OutputSize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inbox: Mutex::new(Inbox {
                    terminated: true,
                    task: None,
                }),
                wakeup: Condvar::new(),
                output_size: ArcSwap::from_pointee(output_size),
                renderer,
            }),
            worker: None,
        }
    }

    pub fn poster(&self) -> FramePoster {
        FramePoster {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn post_image(
        &self,
        stream: StreamHandle,
        buffer: &Arc<FrameBuffer>,
        recycler: Arc<dyn FrameRecycler>,
    ) {
        self.shared.post(stream, buffer, recycler);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.inbox().terminated
    }

    pub fn start(&mut self) -> Result<()> {
        {
            let mut inbox = self.shared.inbox();
            if !inbox.terminated {
                return Err(AcquisitionError::AlreadyRunning);
            }
            inbox.terminated = false;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("acqview-transcode".into())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!("Transcode worker started");
                Ok(())
            }
            Err(e) => {
                self.shared.inbox().terminated = true;
                Err(e.into())
            }
        }
    }

    /// Stop the worker and wait for it. Any pending frame is canceled; a
    /// conversion in progress runs to completion first.
    pub fn stop(&mut self) {
        let pending = {
            let mut inbox = self.shared.inbox();
            if inbox.terminated {
                return;
            }
            inbox.terminated = true;
            inbox.task.take().map(|mut task| {
                task.cancel();
                task
            })
        };
        drop(pending);

        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Transcode worker panicked");
            }
        }
        info!("Transcode worker stopped");
    }

    pub fn set_output_size(&self, size: OutputSize) {
        self.shared.output_size.store(Arc::new(size));
    }

    pub fn output_size(&self) -> OutputSize {
        **self.shared.output_size.load()
    }
}

impl Drop for TranscodeQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Fixed set of aligned frame buffers shared with the capture driver

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::capture::driver::{CaptureDriver, DriverStatus, FrameCallback, StreamHandle};
use crate::capture::frame::{BufferState, FrameBuffer, SessionId};
use crate::error::{AcquisitionError, Result};

/// Heap block with a caller-chosen alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; access goes through
// `&self`/`&mut self` like a `Box<[u8]>`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` zeroed bytes. Alignments that are not a power of two
    /// are rounded up to the next one.
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(AcquisitionError::InvalidPayload);
        }
        let oom = AcquisitionError::OutOfMemory { bytes: size };
        let align = alignment.max(1).checked_next_power_of_two().ok_or(oom)?;
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| AcquisitionError::OutOfMemory { bytes: size })?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AcquisitionError::OutOfMemory { bytes: size })?;

        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Queue one buffer with the driver, keeping the slot state in step.
///
/// A refused enqueue leaves the buffer pool-owned (`Announced`).
pub(crate) fn enqueue_buffer(
    driver: &dyn CaptureDriver,
    stream: StreamHandle,
    buffer: &Arc<FrameBuffer>,
    callback: Arc<dyn FrameCallback>,
) -> Result<()> {
    buffer.transition(BufferState::InFlight)?;
    if let Err(status) = driver.queue_frame(stream, buffer, callback) {
        let _ = buffer.transition(BufferState::Announced);
        return Err(AcquisitionError::driver("queue_frame", status));
    }
    Ok(())
}

/// Arena of frame buffers allocated once per capture session
pub struct FramePool {
    buffers: Vec<Arc<FrameBuffer>>,
    payload_size: usize,
    alignment: usize,
}

impl FramePool {
    pub fn allocate(
        count: usize,
        payload_size: usize,
        alignment: usize,
        context: SessionId,
    ) -> Result<Self> {
        let buffers = (0..count)
            .map(|index| {
                AlignedBuffer::new(payload_size, alignment)
                    .map(|memory| Arc::new(FrameBuffer::new(index, Some(context), memory)))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(count, payload_size, alignment, "Frame pool allocated");

        Ok(Self {
            buffers,
            payload_size,
            alignment,
        })
    }

    pub fn buffers(&self) -> &[Arc<FrameBuffer>] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state() == state).count()
    }

    /// Announce every buffer. On the first failure all buffers are revoked
    /// again and the failure is returned.
    pub fn announce_all(&self, driver: &dyn CaptureDriver, stream: StreamHandle) -> Result<()> {
        for buffer in &self.buffers {
            buffer.transition(BufferState::Announced)?;
            if let Err(status) = driver.announce(stream, buffer) {
                self.revoke_all(driver, stream);
                return Err(AcquisitionError::driver("announce", status));
            }
        }
        Ok(())
    }

    /// Try to queue every announced buffer. Returns how many made it and
    /// the status of the last refusal.
    pub fn enqueue_all(
        &self,
        driver: &dyn CaptureDriver,
        stream: StreamHandle,
        callback: &Arc<dyn FrameCallback>,
    ) -> (usize, Option<DriverStatus>) {
        let mut enqueued = 0;
        let mut last_error = None;

        for buffer in &self.buffers {
            match enqueue_buffer(driver, stream, buffer, Arc::clone(callback)) {
                Ok(()) => enqueued += 1,
                Err(AcquisitionError::Driver { status, .. }) => {
                    debug!(index = buffer.index(), %status, "Buffer could not be enqueued");
                    last_error = Some(status);
                }
                Err(e) => warn!(index = buffer.index(), "Buffer not enqueued: {}", e),
            }
        }

        (enqueued, last_error)
    }

    /// The driver dropped its queue; queued buffers are pool-owned again
    pub fn mark_flushed(&self) {
        for buffer in &self.buffers {
            if buffer.state() == BufferState::InFlight {
                let _ = buffer.transition(BufferState::Announced);
            }
        }
    }

    /// Unregister all buffers from the driver and free their memory.
    /// Calling it again is a no-op.
    pub fn revoke_all(&self, driver: &dyn CaptureDriver, stream: StreamHandle) {
        if self.buffers.iter().all(|b| b.state() == BufferState::Revoked) {
            return;
        }

        // error ignored on purpose, the memory goes away regardless
        if let Err(status) = driver.revoke_all(stream) {
            warn!(%status, "Revoking frame buffers failed");
        }

        for buffer in &self.buffers {
            if buffer.state() == BufferState::InFlight {
                warn!(index = buffer.index(), "Revoking buffer still queued with the driver");
            }
            if buffer.transition(BufferState::Revoked).is_ok() {
                buffer.release();
            }
        }
    }
}

use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::capture::pool::AlignedBuffer;
use crate::error::{AcquisitionError, Result};

/// Pixel formats a camera may deliver or the pipeline may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    /// 10 significant bits in a little-endian 16-bit container
    Mono10,
    Mono12,
    Mono16,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    /// YUV 4:2:2 packed as Y0 U Y1 V
    Yuv422,
    BayerRg8,
}

impl PixelFormat {
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRg8 => 8,
            PixelFormat::Mono10 | PixelFormat::Mono12 | PixelFormat::Mono16 => 16,
            PixelFormat::Yuv422 => 16,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 24,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TooSmall,
    #[default]
    Invalid,
}

/// Which metadata fields the driver filled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    pub const DIMENSION: Self = Self(1);
    pub const OFFSET: Self = Self(1 << 1);
    pub const FRAME_ID: Self = Self(1 << 2);
    pub const TIMESTAMP: Self = Self(1 << 3);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Metadata the driver writes on capture completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub format: PixelFormat,
    pub status: FrameStatus,
    pub flags: FrameFlags,
    pub frame_id: u64,
    pub timestamp: u64,
    pub image_size: u32,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            offset_x: 0,
            offset_y: 0,
            format: PixelFormat::Mono8,
            status: FrameStatus::Invalid,
            flags: FrameFlags::NONE,
            frame_id: 0,
            timestamp: 0,
            image_size: 0,
        }
    }
}

impl FrameMeta {
    /// Completed and carrying dimensions, i.e. worth converting
    pub fn is_convertible(&self) -> bool {
        self.status == FrameStatus::Complete && self.flags.contains(FrameFlags::DIMENSION)
    }
}

/// Identifies the capture session a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Ownership state of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated, unknown to the driver
    Free,
    /// Registered with the driver, owned by the pool
    Announced,
    /// Queued with or being filled by the driver
    InFlight,
    /// Handed back by the driver, owned by a transcode task
    Pending,
    /// Unregistered, memory released
    Revoked,
}

impl BufferState {
    pub fn can_transition(self, to: BufferState) -> bool {
        use BufferState::*;
        match (self, to) {
            (Revoked, _) => false,
            (_, Revoked) => true,
            (Free, Announced) => true,
            (Announced | Pending, InFlight) => true,
            (InFlight, Pending) => true,
            (InFlight | Pending, Announced) => true,
            _ => false,
        }
    }
}

struct Slot {
    state: BufferState,
    memory: Option<AlignedBuffer>,
    meta: FrameMeta,
}

/// One slot of the frame pool: aligned payload memory plus the metadata the
/// driver fills in. Shared between pool, driver and transcode task through
/// `Arc`, with the state tag deciding who may touch it.
pub struct FrameBuffer {
    index: usize,
    context: Option<SessionId>,
    payload_size: usize,
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new(index: usize, context: Option<SessionId>, memory: AlignedBuffer) -> Self {
        Self {
            index,
            context,
            payload_size: memory.len(),
            slot: Mutex::new(Slot {
                state: BufferState::Free,
                memory: Some(memory),
                meta: FrameMeta::default(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Session id embedded at announce time
    pub fn context(&self) -> Option<SessionId> {
        self.context
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn alignment(&self) -> Option<usize> {
        self.slot().memory.as_ref().map(AlignedBuffer::alignment)
    }

    pub fn state(&self) -> BufferState {
        self.slot().state
    }

    pub fn meta(&self) -> FrameMeta {
        self.slot().meta
    }

    pub fn is_released(&self) -> bool {
        self.slot().memory.is_none()
    }

    /// Move the slot to `to`, returning the state it left
    pub fn transition(&self, to: BufferState) -> Result<BufferState> {
        let mut slot = self.slot();
        let from = slot.state;
        if !from.can_transition(to) {
            return Err(AcquisitionError::IllegalTransition {
                index: self.index,
                from,
                to,
            });
        }
        slot.state = to;
        Ok(from)
    }

    /// Driver side: write a captured frame into the slot.
    ///
    /// Returns `false` when the memory has already been released.
    pub fn complete<F>(&self, meta: FrameMeta, write: F) -> bool
    where
        F: FnOnce(&mut [u8]),
    {
        let mut slot = self.slot();
        let Some(memory) = slot.memory.as_mut() else {
            return false;
        };
        write(memory.as_mut_slice());
        slot.meta = meta;
        true
    }

    /// Read access to the captured payload and its metadata
    pub fn with_payload<R, F>(&self, read: F) -> Result<R>
    where
        F: FnOnce(&FrameMeta, &[u8]) -> R,
    {
        let slot = self.slot();
        let memory = slot
            .memory
            .as_ref()
            .ok_or(AcquisitionError::BufferReleased)?;
        Ok(read(&slot.meta, memory.as_slice()))
    }

    /// Free the payload memory; the slot is unusable afterwards
    pub(crate) fn release(&self) {
        let mut slot = self.slot();
        slot.memory = None;
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot();
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("context", &self.context)
            .field("state", &slot.state)
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(0, Some(SessionId::next()), AlignedBuffer::new(64, 16).unwrap())
    }

    #[test]
    fn lifecycle_transitions_are_checked() {
        let buf = buffer();
        assert_eq!(buf.state(), BufferState::Free);
        assert!(buf.transition(BufferState::InFlight).is_err());

        buf.transition(BufferState::Announced).unwrap();
        buf.transition(BufferState::InFlight).unwrap();
        buf.transition(BufferState::Pending).unwrap();
        buf.transition(BufferState::InFlight).unwrap();
        buf.transition(BufferState::Revoked).unwrap();

        let err = buf.transition(BufferState::Revoked).unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::IllegalTransition {
                from: BufferState::Revoked,
                ..
            }
        ));
    }

    #[test]
    fn released_buffer_rejects_access() {
        let buf = buffer();
        buf.release();
        assert!(buf.is_released());
        assert!(!buf.complete(FrameMeta::default(), |_| {}));
        assert!(matches!(
            buf.with_payload(|_, _| ()),
            Err(AcquisitionError::BufferReleased)
        ));
    }

    #[test]
    fn convertible_needs_complete_status_and_dimensions() {
        let mut meta = FrameMeta {
            status: FrameStatus::Complete,
            flags: FrameFlags::DIMENSION | FrameFlags::FRAME_ID,
            ..FrameMeta::default()
        };
        assert!(meta.is_convertible());

        meta.flags = FrameFlags::FRAME_ID;
        assert!(!meta.is_convertible());

        meta.flags = FrameFlags::DIMENSION;
        meta.status = FrameStatus::Incomplete;
        assert!(!meta.is_convertible());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
    }
}

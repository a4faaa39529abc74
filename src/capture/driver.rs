//! Capture driver boundary
//!
//! The core never talks to hardware directly. Everything it needs from the
//! vendor transport layer goes through [`CaptureDriver`], which mirrors the
//! announce/queue/revoke buffer model of GenICam-style camera SDKs.

use std::fmt;
use std::sync::Arc;

use crate::capture::frame::FrameBuffer;

/// Non-success status code reported by a driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverStatus(i32);

impl DriverStatus {
    pub const INTERNAL_FAULT: Self = Self(-1);
    pub const NOT_FOUND: Self = Self(-3);
    pub const BAD_HANDLE: Self = Self(-4);
    pub const BAD_PARAMETER: Self = Self(-7);
    pub const RESOURCES: Self = Self(-14);
    pub const INVALID_CALL: Self = Self(-15);
    pub const NOT_SUPPORTED: Self = Self(-18);
    pub const INCOMPLETE: Self = Self(-19);
    pub const BUSY: Self = Self(-23);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type DriverResult<T> = Result<T, DriverStatus>;

/// Opaque handle of an opened camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque handle of one of a camera's streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Target of feature reads and command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Device(DeviceHandle),
    Stream(StreamHandle),
}

impl From<DeviceHandle> for Module {
    fn from(handle: DeviceHandle) -> Self {
        Module::Device(handle)
    }
}

impl From<StreamHandle> for Module {
    fn from(handle: StreamHandle) -> Self {
        Module::Stream(handle)
    }
}

/// Camera info refreshed after the device was opened
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
    /// `false` when the id resolved to some other camera's info
    pub local_device: bool,
    pub streams: Vec<StreamHandle>,
}

/// Completion callback handed to the driver with every queued buffer.
///
/// Invoked on a driver-owned thread for successful, failed and canceled
/// captures alike. Implementations must not block.
pub trait FrameCallback: Send + Sync {
    fn frame_done(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>);
}

pub trait CaptureDriver: Send + Sync {
    fn open_device(&self, id: &str) -> DriverResult<DeviceHandle>;

    fn close_device(&self, device: DeviceHandle) -> DriverResult<()>;

    fn device_info(&self, device: DeviceHandle) -> DriverResult<DeviceInfo>;

    /// Bytes per frame negotiated with the device
    fn payload_size(&self, stream: StreamHandle) -> DriverResult<u32>;

    fn feature_int(&self, module: Module, name: &str) -> DriverResult<i64>;

    fn run_command(&self, module: Module, name: &str) -> DriverResult<()>;

    fn is_command_done(&self, module: Module, name: &str) -> DriverResult<bool>;

    /// Register a buffer so the driver may fill it
    fn announce(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>) -> DriverResult<()>;

    /// Unregister every announced buffer of the stream
    fn revoke_all(&self, stream: StreamHandle) -> DriverResult<()>;

    fn capture_start(&self, stream: StreamHandle) -> DriverResult<()>;

    fn capture_end(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Drop every queued buffer without completing it
    fn flush_queue(&self, stream: StreamHandle) -> DriverResult<()>;

    fn queue_frame(
        &self,
        stream: StreamHandle,
        buffer: &Arc<FrameBuffer>,
        callback: Arc<dyn FrameCallback>,
    ) -> DriverResult<()>;
}

/// Feature and command names used by the session
pub mod features {
    pub const STREAM_BUFFER_ALIGNMENT: &str = "StreamBufferAlignment";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
    pub const ADJUST_PACKET_SIZE: &str = "GVSPAdjustPacketSize";
    pub const PACKET_SIZE: &str = "GVSPPacketSize";
}

//! Error types shared by the capture and transcode pipeline

use std::time::Duration;

use thiserror::Error;

use crate::capture::driver::DriverStatus;
use crate::capture::frame::{BufferState, PixelFormat};

pub type Result<T, E = AcquisitionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// A driver call returned a non-success status
    #[error("{operation} call unsuccessful; exit code {status}")]
    Driver {
        operation: &'static str,
        status: DriverStatus,
    },

    #[error("Non-zero payload size required")]
    InvalidPayload,

    #[error("Unable to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("The camera does not provide a stream")]
    NoStream,

    #[error("Device info query failed: {0}")]
    DeviceInfo(String),

    #[error("None of the frames could be enqueued; last exit code {status}")]
    NoBuffersEnqueued { status: DriverStatus },

    #[error("Image transcoder is still running")]
    AlreadyRunning,

    #[error("Command {command} did not complete within {waited:?}")]
    Timeout {
        command: String,
        waited: Duration,
    },

    #[error("Buffer {index}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        index: usize,
        from: BufferState,
        to: BufferState,
    },

    #[error("Unsupported pixel format conversion {from:?} -> {to:?}")]
    UnsupportedFormat { from: PixelFormat, to: PixelFormat },

    #[error("Invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Source buffer holds {actual} bytes, layout needs {required}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("Frame buffer memory already released")]
    BufferReleased,

    #[error("Failed to spawn transcode worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl AcquisitionError {
    pub fn driver(operation: &'static str, status: DriverStatus) -> Self {
        Self::Driver { operation, status }
    }

    /// Zero payloads and failed allocations
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, Self::InvalidPayload | Self::OutOfMemory { .. })
    }

    pub fn is_driver_failure(&self) -> bool {
        matches!(
            self,
            Self::Driver { .. } | Self::NoBuffersEnqueued { .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_names_operation_and_status() {
        let err = AcquisitionError::driver("capture_start", DriverStatus::BAD_HANDLE);
        let msg = err.to_string();
        assert!(msg.contains("capture_start"));
        assert!(msg.contains(&DriverStatus::BAD_HANDLE.code().to_string()));
        assert!(err.is_driver_failure());
        assert!(!err.is_resource_failure());
    }

    #[test]
    fn resource_failures_are_classified() {
        assert!(AcquisitionError::InvalidPayload.is_resource_failure());
        assert!(AcquisitionError::OutOfMemory { bytes: 16 }.is_resource_failure());
        assert!(!AcquisitionError::AlreadyRunning.is_resource_failure());
    }
}

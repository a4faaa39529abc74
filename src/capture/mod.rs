pub mod driver;
pub mod frame;
pub mod pool;
pub mod router;
pub mod session;
pub mod sim;

pub use driver::{CaptureDriver, DriverStatus, FrameCallback};
pub use frame::{BufferState, FrameBuffer, FrameMeta, PixelFormat, SessionId};
pub use pool::FramePool;
pub use router::CallbackRouter;
pub use session::{CaptureSession, SessionSettings};
pub use sim::{SimulatedConfig, SimulatedDriver};

//! In-process capture driver
//!
//! Behaves like a transport layer with one camera per configured id:
//! buffers must be announced before they are queued, queueing needs a
//! started capture, and frames are only produced while acquisition runs.
//! Frames are delivered on demand through [`SimulatedDriver::deliver_next`],
//! on whichever thread calls it, which then plays the driver's callback
//! thread. Faults can be injected through [`SimulatedConfig`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::capture::driver::{
    features, CaptureDriver, DeviceHandle, DeviceInfo, DriverResult, DriverStatus, FrameCallback,
    Module, StreamHandle,
};
use crate::capture::frame::{FrameBuffer, FrameFlags, FrameMeta, FrameStatus, PixelFormat};

const PACKET_SIZE: i64 = 8228;

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Ids that can be opened
    pub devices: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Reported payload size; `None` derives it from the geometry
    pub payload_size: Option<u32>,
    /// `StreamBufferAlignment` attribute; `None` makes the query fail
    pub alignment: Option<i64>,
    pub stream_count: usize,
    /// `false` reports info belonging to another camera
    pub local_device: bool,
    pub packet_size_command: bool,
    /// Announce fails once this many buffers are announced
    pub fail_announce_at: Option<usize>,
    /// Buffer indices the driver refuses to queue
    pub reject_enqueue: HashSet<usize>,
    pub fail_capture_start: bool,
    /// Command that never reports completion
    pub stalled_command: Option<String>,
    pub fail_acquisition_start: bool,
    pub fail_acquisition_stop: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            devices: vec!["DEV_SIM_0".into()],
            width: 64,
            height: 48,
            format: PixelFormat::Mono8,
            payload_size: None,
            alignment: Some(64),
            stream_count: 1,
            local_device: true,
            packet_size_command: false,
            fail_announce_at: None,
            reject_enqueue: HashSet::new(),
            fail_capture_start: false,
            stalled_command: None,
            fail_acquisition_start: false,
            fail_acquisition_stop: false,
        }
    }
}

impl SimulatedConfig {
    fn payload_size(&self) -> u32 {
        self.payload_size.unwrap_or_else(|| {
            let bits = self.width * self.height * self.format.bits_per_pixel();
            bits.div_ceil(8)
        })
    }
}

struct Queued {
    buffer: Arc<FrameBuffer>,
    callback: Arc<dyn FrameCallback>,
}

#[derive(Default)]
struct Camera {
    id: String,
    stream: Option<StreamHandle>,
    announced: Vec<Arc<FrameBuffer>>,
    queue: VecDeque<Queued>,
    capturing: bool,
    acquiring: bool,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    cameras: HashMap<DeviceHandle, Camera>,
    frame_id: u64,
    /// Every buffer ever announced, to detect leaks
    history: Vec<Weak<FrameBuffer>>,
    enqueues: HashMap<usize, usize>,
    commands: Vec<String>,
}

impl State {
    fn camera_for(&mut self, stream: StreamHandle) -> DriverResult<&mut Camera> {
        self.cameras
            .values_mut()
            .find(|c| c.stream == Some(stream))
            .ok_or(DriverStatus::BAD_HANDLE)
    }

    fn camera_for_module(&mut self, module: Module) -> DriverResult<&mut Camera> {
        match module {
            Module::Device(device) => self.cameras.get_mut(&device).ok_or(DriverStatus::BAD_HANDLE),
            Module::Stream(stream) => self.camera_for(stream),
        }
    }
}

pub struct SimulatedDriver {
    config: Mutex<SimulatedConfig>,
    state: Mutex<State>,
}

impl SimulatedDriver {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(State::default()),
        }
    }

    fn config(&self) -> MutexGuard<'_, SimulatedConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change fault injection or geometry on the fly
    pub fn configure(&self, update: impl FnOnce(&mut SimulatedConfig)) {
        update(&mut self.config());
    }

    /// Complete the oldest queued buffer of an acquiring camera
    pub fn deliver_next(&self) -> bool {
        self.deliver(FrameStatus::Complete, FrameFlags::DIMENSION | FrameFlags::FRAME_ID)
    }

    /// Complete the oldest queued buffer with the given status and flags.
    /// Returns `false` when nothing was queued.
    pub fn deliver(&self, status: FrameStatus, flags: FrameFlags) -> bool {
        let (width, height, format) = {
            let config = self.config();
            (config.width, config.height, config.format)
        };

        let (stream, queued, frame_id) = {
            let mut state = self.state();
            state.frame_id += 1;
            let frame_id = state.frame_id;
            let Some((stream, queued)) = state
                .cameras
                .values_mut()
                .filter(|c| c.acquiring)
                .find_map(|c| Some((c.stream?, c.queue.pop_front()?)))
            else {
                return false;
            };
            (stream, queued, frame_id)
        };

        let meta = FrameMeta {
            width,
            height,
            format,
            status,
            flags,
            frame_id,
            image_size: queued.buffer.payload_size() as u32,
            ..FrameMeta::default()
        };
        let written = queued.buffer.complete(meta, |bytes| {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (i as u64 + frame_id) as u8;
            }
        });
        trace!(frame_id, index = queued.buffer.index(), written, "Frame delivered");

        // callbacks run without driver locks, like a real transport layer
        queued.callback.frame_done(stream, &queued.buffer);
        true
    }

    pub fn open_device_count(&self) -> usize {
        self.state().cameras.len()
    }

    pub fn announced_count(&self) -> usize {
        self.state().cameras.values().map(|c| c.announced.len()).sum()
    }

    pub fn queued_count(&self) -> usize {
        self.state().cameras.values().map(|c| c.queue.len()).sum()
    }

    /// How often the buffer with this index was queued
    pub fn enqueue_count(&self, index: usize) -> usize {
        self.state().enqueues.get(&index).copied().unwrap_or(0)
    }

    pub fn total_enqueues(&self) -> usize {
        self.state().enqueues.values().sum()
    }

    /// Announced buffers whose memory has not been released
    pub fn unreleased_buffers(&self) -> usize {
        self.state()
            .history
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|b| !b.is_released())
            .count()
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn is_acquiring(&self) -> bool {
        self.state().cameras.values().any(|c| c.acquiring)
    }

    pub fn is_capturing(&self) -> bool {
        self.state().cameras.values().any(|c| c.capturing)
    }
}

impl CaptureDriver for SimulatedDriver {
    fn open_device(&self, id: &str) -> DriverResult<DeviceHandle> {
        if !self.config().devices.iter().any(|d| d == id) {
            return Err(DriverStatus::NOT_FOUND);
        }

        let mut state = self.state();
        if state.cameras.values().any(|c| c.id == id) {
            return Err(DriverStatus::BUSY);
        }
        state.next_handle += 1;
        let device = DeviceHandle(state.next_handle);
        state.cameras.insert(
            device,
            Camera {
                id: id.to_string(),
                ..Camera::default()
            },
        );
        Ok(device)
    }

    fn close_device(&self, device: DeviceHandle) -> DriverResult<()> {
        self.state()
            .cameras
            .remove(&device)
            .map(|_| ())
            .ok_or(DriverStatus::BAD_HANDLE)
    }

    fn device_info(&self, device: DeviceHandle) -> DriverResult<DeviceInfo> {
        let (stream_count, local_device) = {
            let config = self.config();
            (config.stream_count, config.local_device)
        };

        let mut state = self.state();
        state.next_handle += 1;
        let candidate = StreamHandle(state.next_handle);
        let camera = state
            .cameras
            .get_mut(&device)
            .ok_or(DriverStatus::BAD_HANDLE)?;

        let streams = if stream_count == 0 {
            Vec::new()
        } else {
            let first = *camera.stream.get_or_insert(candidate);
            (0..stream_count as u64)
                .map(|i| StreamHandle(first.0 + i * 1000))
                .collect()
        };

        Ok(DeviceInfo {
            id: camera.id.clone(),
            model: "Simulated Camera".into(),
            local_device,
            streams,
        })
    }

    fn payload_size(&self, stream: StreamHandle) -> DriverResult<u32> {
        self.state().camera_for(stream)?;
        Ok(self.config().payload_size())
    }

    fn feature_int(&self, module: Module, name: &str) -> DriverResult<i64> {
        self.state().camera_for_module(module)?;
        let config = self.config();
        match name {
            features::STREAM_BUFFER_ALIGNMENT => config.alignment.ok_or(DriverStatus::NOT_FOUND),
            features::PACKET_SIZE if config.packet_size_command => Ok(PACKET_SIZE),
            _ => Err(DriverStatus::NOT_FOUND),
        }
    }

    fn run_command(&self, module: Module, name: &str) -> DriverResult<()> {
        let (packet_size_command, fail_start, fail_stop) = {
            let config = self.config();
            (
                config.packet_size_command,
                config.fail_acquisition_start,
                config.fail_acquisition_stop,
            )
        };

        let mut state = self.state();
        let camera = state.camera_for_module(module)?;
        match name {
            features::ACQUISITION_START if fail_start => return Err(DriverStatus::INVALID_CALL),
            features::ACQUISITION_START => camera.acquiring = true,
            features::ACQUISITION_STOP if fail_stop => return Err(DriverStatus::INTERNAL_FAULT),
            features::ACQUISITION_STOP => camera.acquiring = false,
            features::ADJUST_PACKET_SIZE if packet_size_command => {}
            _ => return Err(DriverStatus::NOT_FOUND),
        }
        state.commands.push(name.to_string());
        Ok(())
    }

    fn is_command_done(&self, module: Module, name: &str) -> DriverResult<bool> {
        self.state().camera_for_module(module)?;
        Ok(self.config().stalled_command.as_deref() != Some(name))
    }

    fn announce(&self, stream: StreamHandle, buffer: &Arc<FrameBuffer>) -> DriverResult<()> {
        let fail_at = self.config().fail_announce_at;

        let mut state = self.state();
        let camera = state.camera_for(stream)?;
        if fail_at == Some(camera.announced.len()) {
            return Err(DriverStatus::RESOURCES);
        }
        if camera.announced.iter().any(|b| Arc::ptr_eq(b, buffer)) {
            return Err(DriverStatus::INVALID_CALL);
        }
        camera.announced.push(Arc::clone(buffer));
        state.history.push(Arc::downgrade(buffer));
        Ok(())
    }

    fn revoke_all(&self, stream: StreamHandle) -> DriverResult<()> {
        let mut state = self.state();
        let camera = state.camera_for(stream)?;
        camera.queue.clear();
        camera.announced.clear();
        Ok(())
    }

    fn capture_start(&self, stream: StreamHandle) -> DriverResult<()> {
        let fail = self.config().fail_capture_start;
        let mut state = self.state();
        let camera = state.camera_for(stream)?;
        if fail {
            return Err(DriverStatus::RESOURCES);
        }
        camera.capturing = true;
        Ok(())
    }

    fn capture_end(&self, stream: StreamHandle) -> DriverResult<()> {
        let mut state = self.state();
        let camera = state.camera_for(stream)?;
        if !camera.capturing {
            return Err(DriverStatus::INVALID_CALL);
        }
        camera.capturing = false;
        Ok(())
    }

    fn flush_queue(&self, stream: StreamHandle) -> DriverResult<()> {
        self.state().camera_for(stream)?.queue.clear();
        Ok(())
    }

    fn queue_frame(
        &self,
        stream: StreamHandle,
        buffer: &Arc<FrameBuffer>,
        callback: Arc<dyn FrameCallback>,
    ) -> DriverResult<()> {
        let rejected = self.config().reject_enqueue.contains(&buffer.index());

        let mut state = self.state();
        let camera = state.camera_for(stream)?;
        if !camera.capturing {
            return Err(DriverStatus::INVALID_CALL);
        }
        if !camera.announced.iter().any(|b| Arc::ptr_eq(b, buffer)) {
            return Err(DriverStatus::BAD_PARAMETER);
        }
        if rejected {
            return Err(DriverStatus::RESOURCES);
        }
        camera.queue.push_back(Queued {
            buffer: Arc::clone(buffer),
            callback,
        });
        *state.enqueues.entry(buffer.index()).or_default() += 1;
        Ok(())
    }
}

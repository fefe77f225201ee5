//! Scripted backend for tests
//!
//! Every opened device shares its state with the backend so tests can look
//! at what was written and inject underruns. Writes can also be made to
//! stall, standing in for a device that stopped draining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::buffering::DEFAULT_FRAMES_PER_BUFFER;
use super::device::{AudioBackend, DeviceError, OutputDevice, StreamParams};

#[derive(Debug, Default)]
pub struct FakeDeviceState {
    pub playing: bool,
    pub written: Vec<u8>,
    pub flushes: u32,
    pub volume: Option<f32>,
    pub buffer_frames: u32,
    pub capacity_frames: u32,
    /// Largest number of bytes taken by one write call
    pub max_write: usize,
    /// Underruns added after each write call, front first
    pub underruns_per_write: VecDeque<u32>,
    pub underruns: u32,
}

pub struct FakeBackend {
    frames_per_buffer: u32,
    fail_next_open: AtomicBool,
    live: Arc<AtomicUsize>,
    gate: Arc<WriteGate>,
    devices: Mutex<Vec<Arc<Mutex<FakeDeviceState>>>>,
}

/// Shared by every device of one backend
#[derive(Default)]
struct WriteGate {
    stall: Mutex<Option<Duration>>,
    in_write: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            fail_next_open: AtomicBool::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(WriteGate::default()),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Make every later write block for `timeout` and then fail as stalled
    pub fn stall_writes(&self, timeout: Duration) {
        *self.gate.stall.lock().unwrap() = Some(timeout);
    }

    /// Write calls currently blocked inside a stalled device
    pub fn writers_in_device(&self) -> usize {
        self.gate.in_write.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet dropped
    pub fn live_devices(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened_devices(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// State of the `index`-th device opened
    pub fn device(&self, index: usize) -> Arc<Mutex<FakeDeviceState>> {
        self.devices.lock().unwrap()[index].clone()
    }
}

impl AudioBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn frames_per_buffer(&self) -> u32 {
        self.frames_per_buffer
    }

    fn open(&self, params: &StreamParams) -> Result<Box<dyn OutputDevice>, DeviceError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::NoOutputDevice);
        }
        let frame_bytes = params.format.frame_bytes() as usize;
        let state = Arc::new(Mutex::new(FakeDeviceState {
            buffer_frames: params.format.buffer_frames,
            capacity_frames: params.format.buffer_frames.saturating_mul(4),
            max_write: params.frames_per_buffer as usize * frame_bytes,
            ..FakeDeviceState::default()
        }));
        self.devices.lock().unwrap().push(state.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            state,
            live: self.live.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct FakeDevice {
    state: Arc<Mutex<FakeDeviceState>>,
    live: Arc<AtomicUsize>,
    gate: Arc<WriteGate>,
}

impl OutputDevice for FakeDevice {
    fn play(&mut self) -> Result<(), DeviceError> {
        self.state.lock().unwrap().playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().playing = false;
    }

    fn flush(&mut self) {
        self.state.lock().unwrap().flushes += 1;
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let stall = *self.gate.stall.lock().unwrap();
        if let Some(timeout) = stall {
            self.gate.in_write.fetch_add(1, Ordering::SeqCst);
            thread::sleep(timeout);
            self.gate.in_write.fetch_sub(1, Ordering::SeqCst);
            return Err(DeviceError::Stalled(timeout));
        }

        let mut state = self.state.lock().unwrap();
        let taken = data.len().min(state.max_write.max(1));
        state.written.extend_from_slice(&data[..taken]);
        if let Some(underruns) = state.underruns_per_write.pop_front() {
            state.underruns += underruns;
        }
        Ok(taken)
    }

    fn underrun_count(&self) -> u32 {
        self.state.lock().unwrap().underruns
    }

    fn buffer_capacity_frames(&self) -> u32 {
        self.state.lock().unwrap().capacity_frames
    }

    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.buffer_frames = frames.min(state.capacity_frames);
        Ok(state.buffer_frames)
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().unwrap().volume = Some(volume);
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

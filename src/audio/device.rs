//! Host output device abstraction
//!
//! The protocol layer talks to the host through these two traits so the
//! bridge logic can run against cpal in production and a scripted fake in
//! tests.

use std::time::Duration;

use thiserror::Error;

use super::format::StreamFormat;
use crate::settings::PerformanceMode;

/// Errors raised by a host output device
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no output device available")]
    NoOutputDevice,

    #[error("device rejected the stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("failed to build output stream: {0}")]
    BuildStream(String),

    #[error("failed to start output stream: {0}")]
    PlayStream(String),

    #[error("device accepted no data for {0:?}")]
    Stalled(Duration),

    #[error("output stream is closed")]
    Closed,
}

/// Everything needed to open a device for one guest stream
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub format: StreamFormat,
    pub performance_mode: PerformanceMode,
    /// Host's preferred chunk size in frames
    pub frames_per_buffer: u32,
}

/// An open output stream on the host
pub trait OutputDevice: Send {
    /// Start or resume consuming queued data
    fn play(&mut self) -> Result<(), DeviceError>;

    /// Stop consuming without dropping queued data
    fn pause(&mut self);

    /// Drop queued data that hasn't been played
    fn flush(&mut self);

    fn is_playing(&self) -> bool;

    /// Queue little-endian samples, blocking until at least part of `data`
    /// is accepted. Returns the number of bytes taken.
    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Underruns observed since the device was opened
    fn underrun_count(&self) -> u32;

    /// Largest buffer size (frames) the device can be grown to
    fn buffer_capacity_frames(&self) -> u32;

    /// Resize the device buffer without interrupting playback.
    /// Returns the size actually applied.
    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DeviceError>;

    fn set_volume(&mut self, volume: f32);
}

/// Factory for output devices on one host audio system
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Host-preferred chunk size in frames, probed once and cached
    fn frames_per_buffer(&self) -> u32;

    fn open(&self, params: &StreamParams) -> Result<Box<dyn OutputDevice>, DeviceError>;
}

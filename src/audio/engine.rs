//! cpal output backend
//!
//! Each guest stream gets its own cpal output stream. The protocol thread
//! decodes guest PCM into a [`SampleQueue`]; the cpal callback drains it.
//!
//! `cpal::Stream` is not `Send`, so every stream lives on a small owner
//! thread that builds it, starts it, and drops it when the device handle
//! goes away. Play/pause and volume travel through shared atomics instead.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SupportedBufferSize, SupportedStreamConfigRange};

use super::buffer::{QueueReader, SampleQueue};
use super::buffering::DEFAULT_FRAMES_PER_BUFFER;
use super::device::{AudioBackend, DeviceError, OutputDevice, StreamParams};
use super::format::{decode_samples, StreamFormat};
use crate::settings::PerformanceMode;

/// Device capacity as a multiple of the requested buffer size
const CAPACITY_FACTOR: u32 = 4;

/// How long a blocked write sleeps before checking for room again
const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A write that makes no progress for this long gives up
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the device handle and the audio callback
struct StreamShared {
    playing: AtomicBool,
    /// Set once data has been queued, cleared by flush. Starvation only
    /// counts as an underrun while this is set.
    primed: AtomicBool,
    underruns: AtomicU32,
    /// f32 bits
    volume: AtomicU32,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            primed: AtomicBool::new(false),
            underruns: AtomicU32::new(0),
            volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }
}

/// Fill one callback buffer from the queue
fn write_audio_samples<T: Sample + FromSample<f32>>(
    data: &mut [T],
    reader: &QueueReader,
    shared: &StreamShared,
    scratch: &mut Vec<f32>,
) {
    if !shared.playing.load(Ordering::Relaxed) {
        for sample in data.iter_mut() {
            *sample = T::EQUILIBRIUM;
        }
        return;
    }

    if scratch.len() < data.len() {
        scratch.resize(data.len(), 0.0);
    }
    let wanted = data.len();
    let got = reader.pop_into(&mut scratch[..wanted]).unwrap_or(0);

    if got < wanted && shared.primed.load(Ordering::Relaxed) {
        shared.underruns.fetch_add(1, Ordering::Relaxed);
    }

    let volume = shared.volume();
    for (i, sample) in data.iter_mut().enumerate() {
        *sample = if i < got {
            T::from_sample(scratch[i] * volume)
        } else {
            T::EQUILIBRIUM
        };
    }
}

/// Ask the default output device for its preferred chunk size
fn probe_frames_per_buffer() -> u32 {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        log::warn!(
            "No output device found, assuming {} frames per buffer",
            DEFAULT_FRAMES_PER_BUFFER
        );
        return DEFAULT_FRAMES_PER_BUFFER;
    };

    match device.default_output_config() {
        Ok(config) => match frames_per_buffer_for(config.buffer_size()) {
            Some(frames) => {
                log::info!(
                    "Device buffer range {:?}, using {} frames per buffer",
                    config.buffer_size(),
                    frames
                );
                frames
            }
            None => {
                log::info!(
                    "Device reports no buffer range, assuming {} frames per buffer",
                    DEFAULT_FRAMES_PER_BUFFER
                );
                DEFAULT_FRAMES_PER_BUFFER
            }
        },
        Err(e) => {
            log::warn!(
                "Failed to get default output config ({}), assuming {} frames per buffer",
                e,
                DEFAULT_FRAMES_PER_BUFFER
            );
            DEFAULT_FRAMES_PER_BUFFER
        }
    }
}

/// Chunk size to use for a device's buffer range: the usual 256 frames if
/// the device allows it, its minimum otherwise
fn frames_per_buffer_for(buffer_size: &SupportedBufferSize) -> Option<u32> {
    match buffer_size {
        SupportedBufferSize::Range { min, max } if min <= max && *max > 0 => {
            if (*min..=*max).contains(&DEFAULT_FRAMES_PER_BUFFER) {
                Some(DEFAULT_FRAMES_PER_BUFFER)
            } else {
                Some((*min).max(1))
            }
        }
        _ => None,
    }
}

/// Sample format to open `channels` x `rate` with, if the device takes it.
///
/// `preferred` wins when several formats match.
fn sample_format_for(
    ranges: &[SupportedStreamConfigRange],
    channels: u16,
    rate: u32,
    preferred: SampleFormat,
) -> Option<SampleFormat> {
    let usable: Vec<SampleFormat> = ranges
        .iter()
        .filter(|r| {
            r.channels() == channels
                && (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&rate)
        })
        .map(SupportedStreamConfigRange::sample_format)
        .filter(|f| matches!(f, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16))
        .collect();
    if usable.contains(&preferred) {
        Some(preferred)
    } else {
        usable.first().copied()
    }
}

fn describe_configs(ranges: &[SupportedStreamConfigRange]) -> String {
    ranges
        .iter()
        .map(|r| {
            format!(
                "{}ch {}-{}Hz {:?}",
                r.channels(),
                r.min_sample_rate().0,
                r.max_sample_rate().0,
                r.sample_format()
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Backend on the host's default cpal output device
pub struct CpalBackend {
    frames_per_buffer: OnceLock<u32>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            frames_per_buffer: OnceLock::new(),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn frames_per_buffer(&self) -> u32 {
        *self.frames_per_buffer.get_or_init(|| {
            let frames = probe_frames_per_buffer();
            log::info!("Host frames per buffer: {}", frames);
            frames
        })
    }

    fn open(&self, params: &StreamParams) -> Result<Box<dyn OutputDevice>, DeviceError> {
        CpalDevice::open(params).map(|device| Box::new(device) as Box<dyn OutputDevice>)
    }
}

/// Build and start the cpal stream. Runs on the stream owner thread.
fn build_stream(
    params: &StreamParams,
    reader: QueueReader,
    shared: Arc<StreamShared>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoOutputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using output device: {}", device_name);

    let default_config = device
        .default_output_config()
        .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

    let format = params.format;
    let buffer_size = match params.performance_mode {
        PerformanceMode::LowLatency => cpal::BufferSize::Fixed(params.frames_per_buffer),
        PerformanceMode::None | PerformanceMode::PowerSaving => cpal::BufferSize::Default,
    };
    let config = cpal::StreamConfig {
        channels: format.channels as u16,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size,
    };

    // No resampling happens here, so the guest's exact layout must be supported
    let sample_format = match device.supported_output_configs() {
        Ok(configs) => {
            let ranges: Vec<SupportedStreamConfigRange> = configs.collect();
            sample_format_for(
                &ranges,
                config.channels,
                format.sample_rate,
                default_config.sample_format(),
            )
            .ok_or_else(|| {
                let supported = describe_configs(&ranges);
                log::warn!(
                    "{} can't play {}ch at {}Hz; it supports: {}",
                    device_name,
                    config.channels,
                    format.sample_rate,
                    supported
                );
                DeviceError::UnsupportedConfig(format!(
                    "{}ch at {}Hz not supported (device supports {})",
                    config.channels, format.sample_rate, supported
                ))
            })?
        }
        Err(e) => {
            log::debug!("Failed to list supported output configs: {}", e);
            default_config.sample_format()
        }
    };
    log::debug!("Stream config: {:?}, sample format {:?}", config, sample_format);

    let err_fn = |err: cpal::StreamError| log::error!("Audio stream error: {}", err);
    let stream = match sample_format {
        SampleFormat::F32 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    write_audio_samples(data, &reader, &shared, &mut scratch);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    write_audio_samples(data, &reader, &shared, &mut scratch);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    write_audio_samples(data, &reader, &shared, &mut scratch);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(DeviceError::UnsupportedConfig(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| DeviceError::BuildStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::PlayStream(e.to_string()))?;
    Ok(stream)
}

/// One open cpal output stream
pub struct CpalDevice {
    format: StreamFormat,
    shared: Arc<StreamShared>,
    queue: SampleQueue,
    capacity_frames: u32,
    /// Decode buffer reused across writes
    scratch: Vec<f32>,
    /// Dropping this tells the owner thread to drop the stream
    close_tx: Option<mpsc::Sender<()>>,
    owner: Option<JoinHandle<()>>,
}

impl CpalDevice {
    pub fn open(params: &StreamParams) -> Result<Self, DeviceError> {
        let format = params.format;
        let channels = format.channels as usize;
        let capacity_frames = format.buffer_frames.saturating_mul(CAPACITY_FACTOR);

        let (mut queue, reader) = SampleQueue::new(capacity_frames as usize * channels);
        queue.set_limit(format.buffer_frames as usize * channels);
        let shared = Arc::new(StreamShared::new());

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let (close_tx, close_rx) = mpsc::channel::<()>();
        let thread_params = *params;
        let thread_shared = Arc::clone(&shared);

        let owner = thread::Builder::new()
            .name("aserver-stream".to_string())
            .spawn(move || {
                let stream = match build_stream(&thread_params, reader, thread_shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the device handle drops its sender
                let _ = close_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::BuildStream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = owner.join();
                return Err(e);
            }
            Err(_) => {
                let _ = owner.join();
                return Err(DeviceError::Closed);
            }
        }

        log::info!(
            "Opened output: {} ch, {}, {} Hz, buffer {} frames (capacity {})",
            format.channels,
            format.encoding,
            format.sample_rate,
            format.buffer_frames,
            capacity_frames
        );

        Ok(Self {
            format,
            shared,
            queue,
            capacity_frames,
            scratch: Vec::new(),
            close_tx: Some(close_tx),
            owner: Some(owner),
        })
    }

    fn stream_alive(&self) -> bool {
        self.owner.as_ref().is_some_and(|owner| !owner.is_finished())
    }
}

impl OutputDevice for CpalDevice {
    fn play(&mut self) -> Result<(), DeviceError> {
        if !self.stream_alive() {
            return Err(DeviceError::Closed);
        }
        self.shared.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.playing.store(false, Ordering::Relaxed);
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.shared.primed.store(false, Ordering::Relaxed);
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let frame_bytes = self.format.frame_bytes() as usize;
        let channels = self.format.channels as usize;
        if data.len() < frame_bytes {
            // A trailing partial frame can never be played
            return Ok(data.len());
        }

        let started = Instant::now();
        loop {
            let room_frames = self.queue.vacant() / channels;
            if room_frames > 0 {
                let frames = room_frames.min(data.len() / frame_bytes);
                self.scratch.clear();
                decode_samples(self.format.encoding, &data[..frames * frame_bytes], &mut self.scratch);
                let pushed = self.queue.push(&self.scratch);
                self.shared.primed.store(true, Ordering::Relaxed);
                return Ok(pushed / channels * frame_bytes);
            }

            if !self.stream_alive() {
                return Err(DeviceError::Closed);
            }
            if started.elapsed() >= WRITE_STALL_TIMEOUT {
                return Err(DeviceError::Stalled(WRITE_STALL_TIMEOUT));
            }
            thread::sleep(WRITE_POLL_INTERVAL);
        }
    }

    fn underrun_count(&self) -> u32 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    fn buffer_capacity_frames(&self) -> u32 {
        self.capacity_frames
    }

    fn set_buffer_size_frames(&mut self, frames: u32) -> Result<u32, DeviceError> {
        let channels = self.format.channels as usize;
        let frames = frames.clamp(1, self.capacity_frames.max(1));
        self.queue.set_limit(frames as usize * channels);
        Ok((self.queue.limit() / channels) as u32)
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.shared.playing.store(false, Ordering::Relaxed);
        self.close_tx = None;
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                log::error!("Audio stream thread panicked");
            }
        }
    }
}

//! Audio bridge client - per-connection playback state
//!
//! One `AudioClient` is attached to every connection as its tag. It wraps a
//! host output device and tracks the negotiated format, how many bytes the
//! guest has pushed, and the underrun count seen at the last write so the
//! device buffer can grow when playback starves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffering::next_buffer_size;
use super::device::{AudioBackend, OutputDevice, StreamParams};
use super::format::{normalize_byte_order, StreamFormat};
use crate::settings::AudioOptions;
use crate::shm::SharedSegment;

/// Minimum spacing between repeated write-path log lines
const WRITE_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Playback state of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No device open
    Idle,
    /// Device open and accepting data
    Prepared,
    Playing,
    Paused,
}

/// Rate limiter for log lines emitted on every write
#[derive(Debug)]
struct LogThrottle {
    last: Option<Instant>,
}

impl LogThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < WRITE_LOG_INTERVAL => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct AudioClient {
    backend: Arc<dyn AudioBackend>,
    options: AudioOptions,
    device: Option<Box<dyn OutputDevice>>,
    format: Option<StreamFormat>,
    state: PlaybackState,
    /// Current device buffer size in frames (grows on underrun)
    buffer_frames: u32,
    buffer_capacity: u32,
    frames_per_buffer: u32,
    /// Bytes accepted by the device since the last PREPARE
    position: u64,
    previous_underrun_count: u32,
    segment: Option<SharedSegment>,
    /// Staging copy of the shared window; sized only while a segment exists
    staging: Vec<u8>,
    staged_len: usize,
    write_log: LogThrottle,
}

impl AudioClient {
    pub fn new(backend: Arc<dyn AudioBackend>, options: AudioOptions) -> Self {
        Self {
            backend,
            options,
            device: None,
            format: None,
            state: PlaybackState::Idle,
            buffer_frames: 0,
            buffer_capacity: 0,
            frames_per_buffer: 0,
            position: 0,
            previous_underrun_count: 0,
            segment: None,
            staging: Vec::new(),
            staged_len: 0,
            write_log: LogThrottle::new(),
        }
    }

    pub fn options(&self) -> &AudioOptions {
        &self.options
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Host chunk size, as probed by the backend
    pub fn frames_per_buffer(&self) -> u32 {
        self.backend.frames_per_buffer()
    }

    /// Current device buffer size in frames
    pub fn buffer_size_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Current device buffer size in bytes
    pub fn buffer_size_bytes(&self) -> u32 {
        let frame_bytes = self.format.map_or(0, |f| f.frame_bytes());
        self.buffer_frames.saturating_mul(frame_bytes)
    }

    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// (Re)open the device for `format`.
    ///
    /// Returns `false` and leaves the client idle if the format is invalid or
    /// the device can't be opened; nothing is propagated to the caller.
    pub fn prepare(&mut self, format: StreamFormat) -> bool {
        self.release();
        self.position = 0;
        self.previous_underrun_count = 0;

        if let Err(e) = format.validate() {
            log::warn!("prepare: {}", e);
            return false;
        }

        self.frames_per_buffer = self.backend.frames_per_buffer();
        let params = StreamParams {
            format,
            performance_mode: self.options.performance_mode,
            frames_per_buffer: self.frames_per_buffer,
        };
        log::debug!(
            "prepare: {} ch, {}, {} Hz, {} frames, perf {:?}, volume {}",
            format.channels,
            format.encoding,
            format.sample_rate,
            format.buffer_frames,
            self.options.performance_mode,
            self.options.volume
        );

        let mut device = match self.backend.open(&params) {
            Ok(device) => device,
            Err(e) => {
                log::error!(
                    "prepare: failed to open {} device ({} ch, {}, {} Hz, {} bytes): {}",
                    self.backend.name(),
                    format.channels,
                    format.encoding,
                    format.sample_rate,
                    format.buffer_bytes().unwrap_or(0),
                    e
                );
                return false;
            }
        };

        if self.options.volume != 1.0 {
            device.set_volume(self.options.volume);
        }
        if let Err(e) = device.play() {
            log::error!("prepare: failed to start playback: {}", e);
            return false;
        }

        self.buffer_frames = format.buffer_frames;
        self.buffer_capacity = device.buffer_capacity_frames();
        self.format = Some(format);
        self.device = Some(device);
        self.state = PlaybackState::Prepared;
        true
    }

    pub fn start(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if !device.is_playing() {
            if let Err(e) = device.play() {
                log::error!("start: {}", e);
                return;
            }
        }
        self.state = PlaybackState::Playing;
    }

    /// Stop playback and drop anything queued
    pub fn stop(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.pause();
            device.flush();
            self.state = PlaybackState::Prepared;
        }
    }

    pub fn pause(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.pause();
            self.state = PlaybackState::Paused;
        }
    }

    pub fn drain(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.flush();
        }
    }

    /// Release the device and the shared segment; the client becomes idle
    pub fn release(&mut self) {
        self.segment = None;
        self.staging = Vec::new();
        self.staged_len = 0;

        if let Some(mut device) = self.device.take() {
            device.pause();
            device.flush();
        }
        self.format = None;
        self.state = PlaybackState::Idle;
    }

    /// Playback position in frames
    pub fn pointer(&self) -> u32 {
        match (&self.device, self.format) {
            (Some(_), Some(format)) => (self.position / format.frame_bytes() as u64) as u32,
            _ => 0,
        }
    }

    /// Push guest PCM to the device, blocking until all of it is queued.
    ///
    /// The buffer is byte-swapped in place for big-endian encodings. Errors
    /// abandon the rest of this buffer; the next write starts fresh.
    pub fn write_data_to_stream(&mut self, data: &mut [u8]) {
        let Some(format) = self.format else {
            if self.write_log.ready() {
                log::debug!("write: no device open, dropping {} bytes", data.len());
            }
            return;
        };
        normalize_byte_order(format.encoding, data);

        let mut offset = 0;
        while offset < data.len() {
            let Some(device) = self.device.as_mut() else {
                return;
            };
            match device.write(&data[offset..]) {
                Ok(0) => break,
                Ok(written) => {
                    offset += written;
                    self.position += written as u64;
                }
                Err(e) => {
                    if self.write_log.ready() {
                        log::warn!(
                            "write: {} after {} of {} bytes (state {:?})",
                            e,
                            offset,
                            data.len(),
                            self.state
                        );
                    }
                    break;
                }
            }
            self.grow_buffer_on_underrun();
        }
    }

    /// Attach a freshly created shared segment and size the staging buffer
    pub fn attach_segment(&mut self, segment: SharedSegment) {
        self.staging = vec![0; self.buffer_size_bytes() as usize];
        self.staged_len = 0;
        self.segment = Some(segment);
    }

    /// Copy `len` bytes from the shared window into the staging buffer.
    ///
    /// Returns `false` if there is no segment or `len` doesn't fit.
    pub fn stage_from_segment(&mut self, len: u32) -> bool {
        let Some(segment) = self.segment.as_ref() else {
            return false;
        };
        let len = len as usize;
        if len == 0 || len > segment.payload_capacity() || len > self.staging.len() {
            if self.write_log.ready() {
                log::warn!(
                    "write: skipped shared write of {} bytes (window {}, staging {})",
                    len,
                    segment.payload_capacity(),
                    self.staging.len()
                );
            }
            return false;
        }
        if !segment.read_payload(&mut self.staging[..len]) {
            return false;
        }
        self.staged_len = len;
        true
    }

    /// Play what `stage_from_segment` copied, then publish the new position
    pub fn play_staged(&mut self) {
        let mut staging = std::mem::take(&mut self.staging);
        let len = std::mem::take(&mut self.staged_len).min(staging.len());
        self.write_data_to_stream(&mut staging[..len]);
        self.staging = staging;

        if let Some(segment) = self.segment.as_ref() {
            segment.store_position(self.pointer());
        }
    }

    /// Grow the device buffer by one chunk if new underruns showed up
    fn grow_buffer_on_underrun(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let count = device.underrun_count();
        if count <= self.previous_underrun_count {
            return;
        }
        let delta = count - self.previous_underrun_count;
        self.previous_underrun_count = count;

        let next = next_buffer_size(
            self.buffer_frames,
            delta,
            self.frames_per_buffer,
            self.buffer_capacity,
        );
        if next == self.buffer_frames {
            return;
        }
        match device.set_buffer_size_frames(next) {
            Ok(applied) => {
                log::debug!(
                    "underrun: buffer {} -> {} frames (capacity {})",
                    self.buffer_frames,
                    applied,
                    self.buffer_capacity
                );
                self.buffer_frames = applied;
            }
            Err(e) => log::warn!("underrun: failed to resize buffer: {}", e),
        }
    }
}

impl Drop for AudioClient {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AudioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClient")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("buffer_frames", &self.buffer_frames)
            .field("position", &self.position)
            .field("segment", &self.segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeBackend;
    use crate::audio::format::SampleEncoding;

    fn stereo_s16(buffer_frames: u32) -> StreamFormat {
        StreamFormat {
            channels: 2,
            encoding: SampleEncoding::S16Le,
            sample_rate: 48000,
            buffer_frames,
        }
    }

    fn client_with(backend: &Arc<FakeBackend>) -> AudioClient {
        AudioClient::new(backend.clone(), AudioOptions::default())
    }

    #[test]
    fn test_prepare_opens_device() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);

        assert!(client.prepare(stereo_s16(1024)));
        assert_eq!(client.state(), PlaybackState::Prepared);
        assert_eq!(client.buffer_size_bytes(), 4096);
        assert_eq!(backend.live_devices(), 1);
        assert!(backend.device(0).lock().unwrap().playing);
    }

    #[test]
    fn test_invalid_prepare_leaves_client_idle() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        assert!(client.prepare(stereo_s16(1024)));

        assert!(!client.prepare(stereo_s16(0)));
        assert_eq!(client.state(), PlaybackState::Idle);
        assert_eq!(backend.live_devices(), 0);

        // Writes are dropped without a device
        client.write_data_to_stream(&mut [0u8; 16]);
        assert_eq!(client.pointer(), 0);
    }

    #[test]
    fn test_open_failure_is_not_fatal() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_next_open();
        let mut client = client_with(&backend);

        assert!(!client.prepare(stereo_s16(256)));
        assert_eq!(client.state(), PlaybackState::Idle);

        // A later PREPARE can retry
        assert!(client.prepare(stereo_s16(256)));
    }

    #[test]
    fn test_pointer_tracks_bytes_written() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(1024));

        let mut last = 0;
        for _ in 0..4 {
            client.write_data_to_stream(&mut vec![0u8; 1000]);
            let pointer = client.pointer();
            assert!(pointer >= last);
            last = pointer;
        }
        assert_eq!(client.pointer(), 4000 / 4);

        // PREPARE starts counting again
        client.prepare(stereo_s16(1024));
        assert_eq!(client.pointer(), 0);
    }

    #[test]
    fn test_silence_round_trip_within_one_chunk() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(1024));

        let frames = 3000u32;
        client.write_data_to_stream(&mut vec![0u8; frames as usize * 4]);
        let pointer = client.pointer();
        assert!(frames.abs_diff(pointer) <= backend.frames_per_buffer());
    }

    #[test]
    fn test_big_endian_data_reaches_device_little_endian() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(StreamFormat {
            channels: 1,
            encoding: SampleEncoding::S16Be,
            sample_rate: 22050,
            buffer_frames: 64,
        });

        client.write_data_to_stream(&mut [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(backend.device(0).lock().unwrap().written, vec![0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_underruns_grow_buffer_by_chunks() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(1024));
        let chunk = backend.frames_per_buffer();
        let capacity = backend.device(0).lock().unwrap().capacity_frames;

        // Two consecutive writes each see one new underrun
        backend.device(0).lock().unwrap().underruns_per_write.extend([1, 1]);
        let chunk_bytes = backend.device(0).lock().unwrap().max_write;
        client.write_data_to_stream(&mut vec![0u8; chunk_bytes * 2]);

        let grown = client.buffer_size_frames();
        assert!(grown > 1024);
        assert!(grown - 1024 <= 2 * chunk);
        assert!(grown <= capacity);
        assert_eq!(backend.device(0).lock().unwrap().buffer_frames, grown);
    }

    #[test]
    fn test_buffer_growth_stops_at_capacity() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(256));
        let capacity = backend.device(0).lock().unwrap().capacity_frames;

        backend
            .device(0)
            .lock()
            .unwrap()
            .underruns_per_write
            .extend(std::iter::repeat(1).take(64));
        client.write_data_to_stream(&mut vec![0u8; 256 * 4 * 64]);
        assert_eq!(client.buffer_size_frames(), capacity);
    }

    #[test]
    fn test_stop_pause_start_transitions() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(256));

        client.start();
        assert_eq!(client.state(), PlaybackState::Playing);
        client.pause();
        assert_eq!(client.state(), PlaybackState::Paused);
        assert!(!backend.device(0).lock().unwrap().playing);
        client.start();
        assert!(backend.device(0).lock().unwrap().playing);
        client.stop();
        assert_eq!(client.state(), PlaybackState::Prepared);
        assert_eq!(backend.device(0).lock().unwrap().flushes, 1);

        client.release();
        assert_eq!(client.state(), PlaybackState::Idle);
        client.start();
        assert_eq!(client.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_volume_applied_only_when_not_unity() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = AudioClient::new(
            backend.clone(),
            AudioOptions {
                volume: 0.5,
                ..AudioOptions::default()
            },
        );
        client.prepare(stereo_s16(256));
        assert_eq!(backend.device(0).lock().unwrap().volume, Some(0.5));

        let mut unity = client_with(&backend);
        unity.prepare(stereo_s16(256));
        assert_eq!(backend.device(1).lock().unwrap().volume, None);
    }

    #[test]
    fn test_shared_segment_write_publishes_position() {
        let backend = Arc::new(FakeBackend::new());
        let mut client = client_with(&backend);
        client.prepare(stereo_s16(256));

        let (segment, fd) = SharedSegment::create("aserver-client-test", 1024).unwrap();
        let guest = SharedSegment::map(&fd, segment.len()).unwrap();
        client.attach_segment(segment);

        guest.write_payload(&[7u8; 512]);
        assert!(client.stage_from_segment(512));
        client.play_staged();

        assert_eq!(guest.load_position(), 128);
        assert_eq!(backend.device(0).lock().unwrap().written, vec![7u8; 512]);

        assert!(!client.stage_from_segment(0));
        assert!(!client.stage_from_segment(2048));
    }
}

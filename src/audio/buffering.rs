//! Buffer sizing: latency targets and underrun-driven growth
//!
//! Both rules are pure functions of their inputs so they can be exercised
//! without a device.

use super::format::SampleEncoding;

/// Chunk size used when the host offers no preferred frames-per-buffer
pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 256;

/// Round `frames` up to a whole number of `chunk`-frame chunks (at least one)
pub fn round_up_to_chunk(frames: u64, chunk: u32) -> u64 {
    let chunk = chunk.max(1) as u64;
    frames.div_ceil(chunk).max(1) * chunk
}

/// Minimum recommended buffer size in bytes for a latency target.
///
/// `latency_millis * sample_rate / 1000` frames, rounded up to the host's
/// preferred chunk, times the frame size.
pub fn min_buffer_size_bytes(
    latency_millis: u16,
    channels: u8,
    encoding: SampleEncoding,
    sample_rate: u32,
    frames_per_buffer: u32,
) -> u32 {
    let frame_bytes = channels as u64 * encoding.byte_width() as u64;
    if frame_bytes == 0 || sample_rate == 0 {
        return 0;
    }
    let frames = (latency_millis as u64 * sample_rate as u64).div_ceil(1000);
    let bytes = round_up_to_chunk(frames, frames_per_buffer) * frame_bytes;
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

/// Buffer size (frames) to use after observing `underrun_delta` new underruns.
///
/// Each observation grows the buffer by one chunk, never past `capacity`.
/// A zero capacity means the device didn't report one, so nothing changes.
pub fn next_buffer_size(current: u32, underrun_delta: u32, chunk: u32, capacity: u32) -> u32 {
    if underrun_delta == 0 || capacity == 0 || current >= capacity {
        return current;
    }
    current.saturating_add(chunk).min(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_16ms_stereo_s16() {
        let naive = 16 * 48000 / 1000 * 4;
        let size = min_buffer_size_bytes(16, 2, SampleEncoding::S16Le, 48000, 256);
        assert!(size >= naive);
        assert_eq!(size, 3072);
        assert_eq!(size % (256 * 4), 0);
    }

    #[test]
    fn test_latency_rounds_up_to_chunk() {
        // 768 frames with 240-frame chunks -> 4 chunks
        let size = min_buffer_size_bytes(16, 2, SampleEncoding::S16Le, 48000, 240);
        assert_eq!(size, 960 * 4);

        // Tiny latency still yields one chunk
        let size = min_buffer_size_bytes(1, 1, SampleEncoding::U8, 8000, 256);
        assert_eq!(size, 256);
    }

    #[test]
    fn test_latency_degenerate_inputs() {
        assert_eq!(min_buffer_size_bytes(16, 0, SampleEncoding::U8, 48000, 256), 0);
        assert_eq!(min_buffer_size_bytes(16, 2, SampleEncoding::U8, 0, 256), 0);
    }

    #[test]
    fn test_growth_only_on_underrun() {
        assert_eq!(next_buffer_size(1024, 0, 256, 4096), 1024);
        assert_eq!(next_buffer_size(1024, 1, 256, 4096), 1280);
        assert_eq!(next_buffer_size(1024, 5, 256, 4096), 1280);
    }

    #[test]
    fn test_growth_is_capped() {
        assert_eq!(next_buffer_size(4000, 1, 256, 4096), 4096);
        assert_eq!(next_buffer_size(4096, 1, 256, 4096), 4096);
        assert_eq!(next_buffer_size(1024, 1, 256, 0), 1024);
    }

    #[test]
    fn test_two_underruns_grow_at_most_two_chunks() {
        let chunk = 256;
        let capacity = 8192;
        let start = 1024;
        let once = next_buffer_size(start, 1, chunk, capacity);
        let twice = next_buffer_size(once, 1, chunk, capacity);
        assert!(twice - start <= 2 * chunk);
        assert!(twice <= capacity);
    }
}

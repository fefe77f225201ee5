//! Guest stream format - sample encodings, frame math, byte order
//!
//! The guest describes its stream with a channel count, an encoding code,
//! a sample rate and a buffer size in frames. Everything here is plain data
//! so it can be tested without an audio device.

use thiserror::Error;

/// PCM sample encodings a guest may request, in wire-code order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    U8,
    S16Le,
    S16Be,
    F32Le,
    F32Be,
}

impl SampleEncoding {
    pub const ALL: &[SampleEncoding] = &[
        Self::U8,
        Self::S16Le,
        Self::S16Be,
        Self::F32Le,
        Self::F32Be,
    ];

    /// Decode the one-byte encoding code used on the wire
    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn wire_code(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S16Le => 1,
            Self::S16Be => 2,
            Self::F32Le => 3,
            Self::F32Be => 4,
        }
    }

    /// Bytes per sample
    pub fn byte_width(self) -> u8 {
        match self {
            Self::U8 => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::F32Le | Self::F32Be => 4,
        }
    }

    pub fn is_big_endian(self) -> bool {
        matches!(self, Self::S16Be | Self::F32Be)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
            Self::F32Le => "FLOAT_LE",
            Self::F32Be => "FLOAT_BE",
        }
    }
}

impl std::fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a PREPARE format was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported channel count {0} (expected 1 or 2)")]
    InvalidChannels(u8),

    #[error("unknown sample encoding code {0}")]
    UnknownEncoding(u8),

    #[error("sample rate must be positive")]
    ZeroSampleRate,

    #[error("buffer of {frames} frames x {frame_bytes} bytes is not a positive whole number of frames")]
    InvalidBufferSize { frames: u32, frame_bytes: u32 },
}

/// Stream parameters negotiated by PREPARE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub channels: u8,
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    /// Requested buffer size in frames
    pub buffer_frames: u32,
}

impl StreamFormat {
    /// Build a format from raw PREPARE fields, checking every field
    pub fn from_wire(
        channels: u8,
        encoding: u8,
        sample_rate: u32,
        buffer_frames: u32,
    ) -> Result<Self, FormatError> {
        let encoding = SampleEncoding::from_wire(encoding)
            .ok_or(FormatError::UnknownEncoding(encoding))?;
        let format = Self {
            channels,
            encoding,
            sample_rate,
            buffer_frames,
        };
        format.validate()?;
        Ok(format)
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_bytes(&self) -> u32 {
        self.channels as u32 * self.encoding.byte_width() as u32
    }

    /// Buffer size in bytes, `None` on overflow
    pub fn buffer_bytes(&self) -> Option<u32> {
        self.buffer_frames.checked_mul(self.frame_bytes())
    }

    /// Check the invariants the device relies on: a non-zero frame size and a
    /// buffer that is a positive multiple of it
    pub fn validate(&self) -> Result<(), FormatError> {
        if !(1..=2).contains(&self.channels) {
            return Err(FormatError::InvalidChannels(self.channels));
        }
        if self.sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        let frame_bytes = self.frame_bytes();
        match self.buffer_bytes() {
            Some(bytes) if bytes > 0 && bytes % frame_bytes == 0 => Ok(()),
            _ => Err(FormatError::InvalidBufferSize {
                frames: self.buffer_frames,
                frame_bytes,
            }),
        }
    }
}

/// Byte-swap big-endian samples in place so the buffer is little-endian.
///
/// Little-endian and 8-bit encodings are left untouched. A trailing partial
/// sample is ignored.
pub fn normalize_byte_order(encoding: SampleEncoding, data: &mut [u8]) {
    if !encoding.is_big_endian() {
        return;
    }
    let width = encoding.byte_width() as usize;
    for sample in data.chunks_exact_mut(width) {
        sample.reverse();
    }
}

/// Convert little-endian samples to f32 in -1.0..1.0, appending to `out`.
///
/// Expects the buffer to have gone through [`normalize_byte_order`] first, so
/// big-endian encodings are read as little-endian here.
pub fn decode_samples(encoding: SampleEncoding, data: &[u8], out: &mut Vec<f32>) {
    match encoding {
        SampleEncoding::U8 => {
            out.extend(data.iter().map(|&b| (b as f32 - 128.0) / 128.0));
        }
        SampleEncoding::S16Le | SampleEncoding::S16Be => {
            out.extend(
                data.chunks_exact(2)
                    .map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0),
            );
        }
        SampleEncoding::F32Le | SampleEncoding::F32Be => {
            out.extend(
                data.chunks_exact(4)
                    .map(|s| f32::from_le_bytes([s[0], s[1], s[2], s[3]]).clamp(-1.0, 1.0)),
            );
        }
    }
}

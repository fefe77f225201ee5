//! Audio module - host output side of the bridge
//!
//! This module provides:
//! - Wire formats and sample decoding
//! - Buffer sizing rules (latency target, underrun growth)
//! - The per-connection `AudioClient` playback state machine
//! - The cpal backend feeding a ring buffer from guest writes

mod buffer;
pub mod buffering;
mod client;
mod device;
mod engine;
mod format;

#[cfg(test)]
pub(crate) mod fake;

// Re-export public types
pub use buffer::{QueueReader, SampleQueue};
pub use client::{AudioClient, PlaybackState};
pub use device::{AudioBackend, DeviceError, OutputDevice, StreamParams};
pub use engine::{CpalBackend, CpalDevice};
pub use format::{decode_samples, normalize_byte_order, FormatError, SampleEncoding, StreamFormat};

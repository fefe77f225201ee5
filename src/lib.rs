//! aserver - audio bridge server
//!
//! Plays a sandboxed guest's PCM stream on the host output device. The guest
//! talks to the server over a Unix domain socket using a small binary
//! protocol; audio data either travels inline or through a shared memory
//! segment whose descriptor is passed on PREPARE.
//!
//! Layers, bottom up:
//! - [`connector`]: epoll multiplexer with pluggable connection/request handlers
//! - [`audio`]: formats, buffer sizing, the per-connection `AudioClient`, cpal output
//! - [`shm`]: memfd-backed shared segments
//! - [`protocol`]: message framing and the audio handlers
//! - [`server`]: composition root with `start`/`stop`

pub mod audio;
pub mod connector;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod shm;

pub use server::{AudioServer, ServerError};
pub use settings::{AudioOptions, ServerSettings};

//! Audio server - composition root
//!
//! Owns the connector for the audio socket and wires the audio protocol
//! handlers into it. `start`/`stop` are the only transitions and both are
//! idempotent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::audio::{AudioBackend, CpalBackend};
use crate::connector::Connector;
use crate::protocol::{AudioConnectionHandler, AudioRequestHandler};
use crate::settings::ServerSettings;

/// Environment variable carrying the socket path to the guest
pub const ENV_SOCKET_PATH: &str = "ANDROID_ALSA_SERVER";
/// Environment variable telling the guest whether to expect shared memory
pub const ENV_USE_SHM: &str = "ANDROID_ASERVER_USE_SHM";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start connector: {0}")]
    Start(#[source] std::io::Error),
}

type AudioConnector = Connector<AudioConnectionHandler, AudioRequestHandler>;

pub struct AudioServer {
    settings: ServerSettings,
    backend: Arc<dyn AudioBackend>,
    connector: Mutex<Option<AudioConnector>>,
}

impl AudioServer {
    pub fn new(settings: ServerSettings, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            settings,
            backend,
            connector: Mutex::new(None),
        }
    }

    /// Server on the host's default output device
    pub fn with_default_backend(settings: ServerSettings) -> Self {
        Self::new(settings, Arc::new(CpalBackend::new()))
    }

    pub fn socket_path(&self) -> &Path {
        &self.settings.socket_path
    }

    /// Bind the socket and start serving. Does nothing if already running.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut slot = self.connector.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        // Probe once; every client reuses the cached value
        let frames_per_buffer = self.backend.frames_per_buffer();
        let audio = &self.settings.audio;
        log::info!(
            "Starting audio server: socket={} backend={} framesPerBuffer={} latencyMillis={} perfMode={} volume={} useShm={}",
            self.settings.socket_path.display(),
            self.backend.name(),
            frames_per_buffer,
            audio.latency_millis,
            audio.performance_mode.code(),
            audio.volume,
            self.settings.use_shm
        );

        let mut connector = Connector::bind(
            &self.settings.socket_path,
            AudioConnectionHandler::new(Arc::clone(&self.backend), self.settings.audio),
            AudioRequestHandler::new(self.settings.use_shm),
        )
        .map_err(|source| ServerError::Bind {
            path: self.settings.socket_path.clone(),
            source,
        })?;
        connector.set_multithreaded_clients(self.settings.multithreaded_clients);
        connector.start().map_err(ServerError::Start)?;

        *slot = Some(connector);
        Ok(())
    }

    /// Stop serving and release every client. Safe to call repeatedly.
    ///
    /// The lock is held until the connector is fully stopped, so a
    /// concurrent `start` can't bind while the old socket is being removed.
    pub fn stop(&self) {
        let mut slot = self.connector.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut connector) = slot.take() {
            connector.stop();
            log::info!("Audio server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(AudioConnector::is_running)
    }

    /// Variables the launcher exports so the guest finds this server
    pub fn guest_environment(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                ENV_SOCKET_PATH,
                self.settings.socket_path.display().to_string(),
            ),
            (ENV_USE_SHM, self.settings.use_shm.to_string()),
        ]
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        self.stop();
    }
}

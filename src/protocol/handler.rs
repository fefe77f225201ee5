//! Audio protocol handlers
//!
//! `AudioConnectionHandler` attaches an [`AudioClient`] to every connection;
//! `AudioRequestHandler` decodes one message at a time and drives that
//! client. Device and shared-memory failures are logged and answered, never
//! propagated: only socket errors close a connection.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{decode, Opcode, Request};
use crate::audio::buffering::min_buffer_size_bytes;
use crate::audio::{AudioBackend, AudioClient, SampleEncoding, StreamFormat};
use crate::connector::{Client, ClientId, ConnectionHandler, OutputStream, RequestHandler};
use crate::settings::AudioOptions;
use crate::shm::SharedSegment;

/// PREPARE reply: a segment descriptor is attached
const PREPARE_SHARED: u8 = 0;
/// PREPARE reply: no segment, use socket writes
const PREPARE_NO_SHARED: u8 = 1;

/// Creates and releases per-connection audio clients
pub struct AudioConnectionHandler {
    backend: Arc<dyn AudioBackend>,
    options: AudioOptions,
}

impl AudioConnectionHandler {
    pub fn new(backend: Arc<dyn AudioBackend>, options: AudioOptions) -> Self {
        Self { backend, options }
    }
}

impl ConnectionHandler for AudioConnectionHandler {
    type Tag = AudioClient;

    fn handle_new_connection(&self, client_id: ClientId) -> AudioClient {
        log::debug!("client {}: new audio client", client_id);
        AudioClient::new(Arc::clone(&self.backend), self.options)
    }

    fn handle_connection_shutdown(&self, client: &mut Client<AudioClient>) {
        client.tag_mut().release();
        log::debug!("client {}: audio client released", client.id());
    }
}

/// Executes audio protocol messages
pub struct AudioRequestHandler {
    use_shm: bool,
    next_segment_id: AtomicU32,
}

impl AudioRequestHandler {
    pub fn new(use_shm: bool) -> Self {
        Self {
            use_shm,
            next_segment_id: AtomicU32::new(0),
        }
    }

    fn execute(
        &self,
        id: ClientId,
        request: Request,
        output: &OutputStream,
        audio: &mut AudioClient,
    ) -> io::Result<()> {
        match request {
            Request::Close => audio.release(),
            Request::Start => audio.start(),
            Request::Stop => audio.stop(),
            Request::Pause => audio.pause(),
            Request::Drain => audio.drain(),

            Request::Prepare {
                channels,
                encoding,
                sample_rate,
                buffer_frames,
            } => {
                let format = StreamFormat::from_wire(channels, encoding, sample_rate, buffer_frames);
                let prepared = match format {
                    Ok(format) => audio.prepare(format),
                    Err(e) => {
                        log::warn!("client {}: rejected PREPARE: {}", id, e);
                        audio.release();
                        false
                    }
                };
                if self.use_shm {
                    self.offer_segment(id, prepared, output, audio)?;
                }
            }

            Request::Write {
                payload: Some(mut payload),
                ..
            } => audio.write_data_to_stream(&mut payload),

            Request::Write {
                length,
                payload: None,
            } => {
                let staged = audio.stage_from_segment(length);
                let mut reply = output.lock();
                reply.write_u8(u8::from(staged));
                reply.send()?;
                if staged {
                    audio.play_staged();
                }
            }

            Request::Pointer => {
                let mut reply = output.lock();
                reply.write_u32(audio.pointer());
                reply.send()?;
            }

            Request::GetBufferSize {
                channels,
                encoding,
                sample_rate,
            } => {
                let size = match SampleEncoding::from_wire(encoding) {
                    Some(encoding) => min_buffer_size_bytes(
                        audio.options().latency_millis,
                        channels,
                        encoding,
                        sample_rate,
                        audio.frames_per_buffer(),
                    ),
                    None => {
                        log::warn!("client {}: GET_BUFFER_SIZE with unknown encoding {}", id, encoding);
                        0
                    }
                };
                let mut reply = output.lock();
                reply.write_u32(size);
                reply.send()?;
            }

            Request::Truncated { opcode, length } => {
                log::warn!("client {}: {:?} payload too short ({} bytes)", id, opcode, length);
                self.answer_truncated(id, opcode, output, audio)?;
            }

            Request::Ignored { opcode, length } => {
                log::debug!("client {}: ignored opcode {} ({} bytes)", id, opcode, length);
            }
        }
        Ok(())
    }

    /// Give a malformed query the same answer a failed one would get, so
    /// the guest isn't left waiting for a reply
    fn answer_truncated(
        &self,
        id: ClientId,
        opcode: Opcode,
        output: &OutputStream,
        audio: &mut AudioClient,
    ) -> io::Result<()> {
        match opcode {
            Opcode::GetBufferSize => {
                let mut reply = output.lock();
                reply.write_u32(0);
                reply.send()
            }
            Opcode::Prepare => {
                audio.release();
                if self.use_shm {
                    self.offer_segment(id, false, output, audio)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Answer a PREPARE on a shared-memory server.
    ///
    /// A segment is created only for a successful prepare; any failure is
    /// reported as "no shared memory" so the guest falls back to socket
    /// writes.
    fn offer_segment(
        &self,
        id: ClientId,
        prepared: bool,
        output: &OutputStream,
        audio: &mut AudioClient,
    ) -> io::Result<()> {
        let segment = if prepared {
            let name = format!(
                "aserver-shm{}",
                self.next_segment_id.fetch_add(1, Ordering::Relaxed) + 1
            );
            match SharedSegment::create(&name, audio.buffer_size_bytes() as usize) {
                Ok(created) => Some(created),
                Err(e) => {
                    log::warn!("client {}: shared memory unavailable: {}", id, e);
                    None
                }
            }
        } else {
            None
        };

        let mut reply = output.lock();
        match segment {
            Some((segment, fd)) => {
                audio.attach_segment(segment);
                reply.write_u8(PREPARE_SHARED);
                reply.set_ancillary_fd(fd);
            }
            None => reply.write_u8(PREPARE_NO_SHARED),
        }
        reply.send()
    }
}

impl RequestHandler<AudioClient> for AudioRequestHandler {
    fn handle_request(&self, client: &mut Client<AudioClient>) -> io::Result<bool> {
        let id = client.id();
        let (input, output, audio) = client.parts();

        let shared_write = self.use_shm && audio.has_segment();
        let Some(request) = decode(input, shared_write)? else {
            return Ok(false);
        };
        log::trace!("client {}: {:?}", id, request);

        self.execute(id, request, output, audio)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeBackend;
    use crate::connector::stream::test_util::recv_with_fd;
    use crate::protocol::wire;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    struct Harness {
        backend: Arc<FakeBackend>,
        connection: AudioConnectionHandler,
        requests: AudioRequestHandler,
        client: Client<AudioClient>,
        guest: UnixStream,
    }

    impl Harness {
        fn new(use_shm: bool) -> Self {
            let backend = Arc::new(FakeBackend::new());
            let connection = AudioConnectionHandler::new(backend.clone(), AudioOptions::default());
            let (server_side, guest) = UnixStream::pair().unwrap();
            let tag = connection.handle_new_connection(7);
            let client = Client::new(7, server_side, tag).unwrap();
            Self {
                backend,
                connection,
                requests: AudioRequestHandler::new(use_shm),
                client,
                guest,
            }
        }

        /// Feed bytes and run the handler until it needs more input
        fn feed(&mut self, bytes: &[u8]) {
            self.client.input().extend_from_slice(bytes);
            while self.requests.handle_request(&mut self.client).unwrap() {}
        }

        fn read_u32(&mut self) -> u32 {
            let mut buf = [0u8; 4];
            self.guest.read_exact(&mut buf).unwrap();
            u32::from_le_bytes(buf)
        }
    }

    #[test]
    fn test_socket_write_and_pointer() {
        let mut h = Harness::new(false);
        h.feed(&wire::prepare(2, SampleEncoding::S16Le.wire_code(), 48000, 1024));
        h.feed(&wire::message(Opcode::Start, &[]));
        h.feed(&wire::message(Opcode::Write, &[0u8; 400]));
        h.feed(&wire::message(Opcode::Pointer, &[]));

        assert_eq!(h.read_u32(), 100);
        assert_eq!(h.backend.device(0).lock().unwrap().written.len(), 400);
    }

    #[test]
    fn test_prepare_with_shm_passes_segment() {
        let mut h = Harness::new(true);
        h.feed(&wire::prepare(2, SampleEncoding::S16Le.wire_code(), 48000, 256));

        let mut status = [0u8; 1];
        let (n, fd) = recv_with_fd(&h.guest, &mut status);
        assert_eq!((n, status[0]), (1, PREPARE_SHARED));
        let fd = fd.expect("segment descriptor");
        let guest_segment = SharedSegment::map(&fd, 256 * 4 + 4).unwrap();

        guest_segment.write_payload(&[3u8; 64]);
        h.feed(&wire::shared_write(64));
        h.guest.read_exact(&mut status).unwrap();
        assert_eq!(status[0], 1);
        assert_eq!(guest_segment.load_position(), 16);
        assert_eq!(h.backend.device(0).lock().unwrap().written, vec![3u8; 64]);

        // A window overrun is refused without touching the device
        h.feed(&wire::shared_write(256 * 4 + 1));
        h.guest.read_exact(&mut status).unwrap();
        assert_eq!(status[0], 0);
        assert_eq!(guest_segment.load_position(), 16);
    }

    #[test]
    fn test_failed_prepare_reports_no_shm() {
        let mut h = Harness::new(true);
        h.feed(&wire::prepare(3, SampleEncoding::S16Le.wire_code(), 48000, 256));

        let mut status = [0u8; 1];
        let (n, fd) = recv_with_fd(&h.guest, &mut status);
        assert_eq!((n, status[0]), (1, PREPARE_NO_SHARED));
        assert!(fd.is_none());
        assert!(!h.client.tag().has_segment());

        // Without a segment WRITE carries its payload on the socket and
        // is dropped while no device is open
        h.feed(&wire::message(Opcode::Write, &[0x80; 8]));
        h.feed(&wire::message(Opcode::Pointer, &[]));
        assert_eq!(h.read_u32(), 0);
        assert_eq!(h.client.input().available(), 0);
    }

    #[test]
    fn test_get_buffer_size_for_latency() {
        let mut h = Harness::new(false);
        h.feed(&wire::get_buffer_size(2, SampleEncoding::S16Le.wire_code(), 48000));
        let size = h.read_u32();
        assert!(size >= 16 * 48000 / 1000 * 4);
        assert_eq!(size % (256 * 4), 0);

        h.feed(&wire::get_buffer_size(2, 99, 48000));
        assert_eq!(h.read_u32(), 0);
    }

    #[test]
    fn test_short_queries_still_get_answers() {
        let mut h = Harness::new(true);
        h.feed(&wire::message(Opcode::GetBufferSize, &[2, 1]));
        assert_eq!(h.read_u32(), 0);

        h.feed(&wire::prepare(2, SampleEncoding::S16Le.wire_code(), 48000, 256));
        let mut status = [0u8; 1];
        let _ = recv_with_fd(&h.guest, &mut status);
        assert_eq!(h.backend.live_devices(), 1);

        h.feed(&wire::message(Opcode::Prepare, &[2, 1, 0x80, 0xbb]));
        let (n, fd) = recv_with_fd(&h.guest, &mut status);
        assert_eq!((n, status[0]), (1, PREPARE_NO_SHARED));
        assert!(fd.is_none());
        assert!(!h.client.tag().has_segment());
        assert_eq!(h.backend.live_devices(), 0);
    }

    #[test]
    fn test_close_releases_device_and_segment() {
        let mut h = Harness::new(true);
        h.feed(&wire::prepare(2, SampleEncoding::F32Le.wire_code(), 44100, 512));
        let mut status = [0u8; 1];
        let _ = recv_with_fd(&h.guest, &mut status);
        assert!(h.client.tag().has_segment());
        assert_eq!(h.backend.live_devices(), 1);

        h.feed(&wire::message(Opcode::Close, &[]));
        assert!(!h.client.tag().has_segment());
        assert_eq!(h.backend.live_devices(), 0);
    }

    #[test]
    fn test_disconnect_hook_releases_device() {
        let mut h = Harness::new(false);
        h.feed(&wire::prepare(2, SampleEncoding::S16Le.wire_code(), 48000, 256));
        assert_eq!(h.backend.live_devices(), 1);

        h.connection.handle_connection_shutdown(&mut h.client);
        assert_eq!(h.backend.live_devices(), 0);
    }
}

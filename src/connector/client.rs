//! One accepted socket connection and the protocol state attached to it

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use super::stream::{InputStream, OutputStream};

/// Identifier handed out by the connector, unique for its lifetime
pub type ClientId = u64;

/// A connected peer.
///
/// The tag is the protocol state owned by the active handler pair. It is
/// created once by the connection handler when the client is accepted and
/// dropped together with the client, so anything it owns (device handles,
/// mappings) is released before the socket itself goes away.
pub struct Client<T> {
    id: ClientId,
    // Field order matters: the tag drops before the socket
    tag: T,
    input: InputStream,
    output: OutputStream,
    stream: UnixStream,
}

impl<T> Client<T> {
    /// Wrap an accepted stream. Fails if the write half cannot be cloned.
    pub fn new(id: ClientId, stream: UnixStream, tag: T) -> io::Result<Self> {
        let output = OutputStream::new(stream.try_clone()?);
        Ok(Self {
            id,
            tag,
            input: InputStream::new(),
            output,
            stream,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn tag_mut(&mut self) -> &mut T {
        &mut self.tag
    }

    pub fn input(&mut self) -> &mut InputStream {
        &mut self.input
    }

    pub fn output(&self) -> &OutputStream {
        &self.output
    }

    /// Borrow input, output and tag at the same time
    pub fn parts(&mut self) -> (&mut InputStream, &OutputStream, &mut T) {
        (&mut self.input, &self.output, &mut self.tag)
    }

    /// Read whatever the socket has into the input buffer
    pub fn fill_input(&mut self) -> io::Result<usize> {
        self.input.fill_from(&mut self.stream)
    }

    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Close both directions; a blocked reader on this socket wakes with EOF
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("client {}: shutdown failed: {}", self.id, e);
            }
        }
    }
}

impl<T> AsFd for Client<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl<T> AsRawFd for Client<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("fd", &self.stream.as_raw_fd())
            .field("buffered", &self.input.available())
            .finish()
    }
}

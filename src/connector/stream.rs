//! Per-connection byte streams
//!
//! `InputStream` accumulates whatever the socket has delivered so far and
//! lets a request handler pull little-endian primitives out of it. A handler
//! that finds a message incomplete rewinds to its mark and waits for more
//! bytes, so a partial message never has side effects.
//!
//! `OutputStream` serializes replies. Every reply is assembled inside an
//! [`OutputLock`], which holds the connection's write mutex until the reply
//! (and any attached file descriptor) has been handed to the kernel.

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};

/// How many bytes to ask the socket for per read call
const READ_CHUNK: usize = 8192;

/// How long a reply may wait for the peer to drain its receive buffer
pub const REPLY_WRITE_TIMEOUT_MS: u16 = 5000;

/// Buffered input side of a connection
#[derive(Debug, Default)]
pub struct InputStream {
    buf: Vec<u8>,
    /// Read cursor into `buf`
    pos: usize,
    /// Position restored by `reset()`
    mark: usize,
}

impl InputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered but not yet consumed
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Remember the current read position
    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    /// Rewind to the last `mark()`
    pub fn reset(&mut self) {
        self.pos = self.mark;
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let [byte] = self.take::<1>()?;
        Ok(byte)
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    /// Copy the next `len` bytes out of the buffer
    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        self.ensure(len)?;
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> io::Result<()> {
        self.ensure(len)?;
        self.pos += len;
        Ok(())
    }

    /// Append bytes received out of band (used by tests and in-process feeds)
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Perform one `read` call on `reader`, appending what it returns.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        match reader.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    fn take<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn ensure(&self, len: usize) -> io::Result<()> {
        if self.available() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("need {} bytes, {} buffered", len, self.available()),
            ));
        }
        Ok(())
    }

    /// Drop consumed bytes from the front of the buffer
    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.buf.drain(..self.pos);
        self.mark = self.mark.saturating_sub(self.pos);
        self.pos = 0;
    }
}

/// Write side of a connection, shared behind a mutex
#[derive(Debug, Clone)]
pub struct OutputStream {
    inner: Arc<Mutex<UnixStream>>,
}

impl OutputStream {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Take the write lock and start building a reply
    pub fn lock(&self) -> OutputLock<'_> {
        OutputLock {
            stream: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            buf: Vec::with_capacity(8),
            fd: None,
        }
    }
}

/// One reply under construction.
///
/// Nothing reaches the socket until [`OutputLock::send`]; dropping the lock
/// without sending discards the reply.
pub struct OutputLock<'a> {
    stream: MutexGuard<'a, UnixStream>,
    buf: Vec<u8>,
    fd: Option<OwnedFd>,
}

impl OutputLock<'_> {
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Attach a descriptor to this reply.
    ///
    /// The descriptor travels with the first byte of the reply and is closed
    /// on our side once the send completes.
    pub fn set_ancillary_fd(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }

    /// Write the reply while still holding the lock.
    ///
    /// Non-blocking sockets are waited on until writable, so a guest that
    /// is slow to read its replies only delays this connection. A peer that
    /// takes no bytes for [`REPLY_WRITE_TIMEOUT_MS`] gets `TimedOut`.
    pub fn send(mut self) -> io::Result<()> {
        let mut sent = 0;
        if let Some(fd) = self.fd.take() {
            if self.buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "a descriptor needs at least one payload byte to ride on",
                ));
            }

            let fds = [fd.as_raw_fd()];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            let iov = [IoSlice::new(&self.buf)];
            sent = loop {
                match sendmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                ) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => wait_writable(&self.stream)?,
                    Err(e) => return Err(e.into()),
                }
            };

            // The receiver holds its own reference now
            drop(fd);
        }

        let mut rest = &self.buf[sent..];
        while !rest.is_empty() {
            match (&*self.stream).write(rest) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(&self.stream)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Block until `stream` can take more bytes
fn wait_writable(stream: &UnixStream) -> io::Result<()> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::from(REPLY_WRITE_TIMEOUT_MS)) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped reading replies",
                ))
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

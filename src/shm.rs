//! Shared ring segment - zero-copy audio transfer with the guest
//!
//! A segment is an anonymous memfd mapped read/write into the server. The
//! descriptor is passed to the guest in the PREPARE reply; after that the
//! server only keeps the mapping.
//!
//! Layout:
//! ```text
//! [0..4)   playback position in frames (u32 LE), written by the server
//! [4..)    payload window, written by the guest before each WRITE
//! ```
//!
//! There is no lock. The guest fills the window, sends WRITE, and waits for
//! the reply before touching the window again, so server and guest never
//! access the payload at the same time.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc::{c_void, off_t};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use thiserror::Error;

/// Size of the position header at the start of every segment
pub const POSITION_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("segment name contains a NUL byte")]
    InvalidName,

    #[error("segment of {0} payload bytes is too large")]
    TooLarge(usize),

    #[error("memfd_create failed: {0}")]
    Create(#[source] Errno),

    #[error("failed to size segment: {0}")]
    Resize(#[source] Errno),

    #[error("mmap failed: {0}")]
    Map(#[source] Errno),
}

/// A mapped shared memory segment
pub struct SharedSegment {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
}

// SAFETY: the mapping is owned exclusively by this value; concurrent access
// by the guest process follows the WRITE handoff described above.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create a segment with room for `payload_len` bytes after the header.
    ///
    /// Returns the mapping and the backing descriptor. The caller is expected
    /// to hand the descriptor to the guest and close it; the mapping stays
    /// valid on its own.
    pub fn create(name: &str, payload_len: usize) -> Result<(Self, OwnedFd), ShmError> {
        let total = payload_len
            .checked_add(POSITION_HEADER_LEN)
            .ok_or(ShmError::TooLarge(payload_len))?;
        let size = off_t::try_from(total).map_err(|_| ShmError::TooLarge(payload_len))?;
        let name = CString::new(name).map_err(|_| ShmError::InvalidName)?;

        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(ShmError::Create)?;
        ftruncate(&fd, size).map_err(ShmError::Resize)?;
        let segment = Self::map(&fd, total)?;
        Ok((segment, fd))
    }

    /// Map an existing segment descriptor of `len` bytes (the guest's view)
    pub fn map(fd: impl AsFd, len: usize) -> Result<Self, ShmError> {
        let len = NonZeroUsize::new(len.max(POSITION_HEADER_LEN))
            .ok_or(ShmError::TooLarge(len))?;
        // SAFETY: fresh shared mapping of a descriptor we were given; no
        // existing Rust memory is aliased.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;
        Ok(Self { ptr, len })
    }

    /// Total mapped bytes, header included
    pub fn len(&self) -> usize {
        self.len.get()
    }

    /// Bytes available for audio payload
    pub fn payload_capacity(&self) -> usize {
        self.len.get() - POSITION_HEADER_LEN
    }

    /// Copy the first `dst.len()` payload bytes out of the window.
    ///
    /// Returns `false` without copying if the window is smaller than `dst`.
    pub fn read_payload(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.payload_capacity() {
            return false;
        }
        // SAFETY: bounds checked above; the mapping lives as long as self.
        unsafe {
            let src = self.ptr.as_ptr().cast::<u8>().add(POSITION_HEADER_LEN);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
        true
    }

    /// Copy `src` into the start of the payload window (guest side)
    pub fn write_payload(&self, src: &[u8]) -> bool {
        if src.len() > self.payload_capacity() {
            return false;
        }
        // SAFETY: bounds checked above; the mapping lives as long as self.
        unsafe {
            let dst = self.ptr.as_ptr().cast::<u8>().add(POSITION_HEADER_LEN);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        true
    }

    /// Publish the playback position for the guest
    pub fn store_position(&self, frames: u32) {
        // SAFETY: the mapping is page aligned and at least 4 bytes long
        unsafe { self.ptr.as_ptr().cast::<u32>().write_volatile(frames.to_le()) }
    }

    pub fn load_position(&self) -> u32 {
        // SAFETY: the mapping is page aligned and at least 4 bytes long
        u32::from_le(unsafe { self.ptr.as_ptr().cast::<u32>().read_volatile() })
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once
        if let Err(e) = unsafe { munmap(self.ptr, self.len.get()) } {
            log::warn!("munmap failed: {}", e);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("len", &self.len)
            .field("position", &self.load_position())
            .finish()
    }
}

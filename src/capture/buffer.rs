//! Frame memory: either plain heap or a shareable memory-mapped region

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use memmap2::MmapMut;

use crate::error::{Error, Result};

enum Storage {
    Heap(Vec<u8>),
    Mapped { map: MmapMut, fd: OwnedFd },
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(v) => v,
            Self::Mapped { map, .. } => map,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(v) => v,
            Self::Mapped { map, .. } => map,
        }
    }
}

/// Memory for one video frame.
///
/// A buffer never decides who owns it: the pool it belongs to tracks whether
/// it is queued to the producer or checked out to the application. The lock
/// only makes concurrent access memory-safe.
pub struct VideoBuf {
    storage: RwLock<Storage>,
    len: usize,
    bytes_used: AtomicUsize,
}

impl VideoBuf {
    /// Zero-filled heap buffer
    pub fn heap(len: usize) -> Self {
        Self {
            storage: RwLock::new(Storage::Heap(vec![0; len])),
            len,
            bytes_used: AtomicUsize::new(0),
        }
    }

    /// Buffer backed by an anonymous memory file, so that its fd can be
    /// handed to another process or device. The mapping is rounded up to a
    /// whole number of pages.
    #[cfg(target_os = "linux")]
    pub fn shared(len: usize) -> Result<Self> {
        use std::fs::File;
        use std::os::fd::FromRawFd;

        if len == 0 {
            return Err(Error::format("cannot map a zero-length buffer"));
        }
        let page = page_size::get();
        let mapped_len = len.div_ceil(page) * page;

        let name = b"iris-frame\0";
        // SAFETY: name is NUL terminated and outlives the call
        let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: raw is a freshly created descriptor that nothing else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let file = File::from(fd);
        file.set_len(mapped_len as u64)?;
        // SAFETY: the memfd is private to this buffer and is never truncated
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            storage: RwLock::new(Storage::Mapped {
                map,
                fd: file.into(),
            }),
            len,
            bytes_used: AtomicUsize::new(0),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn shared(len: usize) -> Result<Self> {
        tracing::warn!("shared buffers need memfd; using heap memory");
        Ok(Self::heap(len))
    }

    /// Allocated length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes written by the last producer
    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn set_bytes_used(&self, n: usize) {
        self.bytes_used.store(n.min(self.len), Ordering::Release);
    }

    /// File descriptor for zero-copy sharing, if the buffer has one
    pub fn dma_fd(&self) -> Option<RawFd> {
        match &*self.lock_read() {
            Storage::Heap(_) => None,
            Storage::Mapped { fd, .. } => Some(fd.as_raw_fd()),
        }
    }

    pub fn read(&self) -> BufRead<'_> {
        BufRead {
            guard: self.lock_read(),
            len: self.len,
        }
    }

    pub fn write(&self) -> BufWrite<'_> {
        BufWrite {
            guard: self.storage.write().unwrap_or_else(|e| e.into_inner()),
            len: self.len,
        }
    }

    fn lock_read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for VideoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoBuf")
            .field("len", &self.len)
            .field("bytes_used", &self.bytes_used())
            .field("dma_fd", &self.dma_fd())
            .finish()
    }
}

pub struct BufRead<'a> {
    guard: RwLockReadGuard<'a, Storage>,
    len: usize,
}

impl Deref for BufRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.as_slice()[..self.len]
    }
}

pub struct BufWrite<'a> {
    guard: RwLockWriteGuard<'a, Storage>,
    len: usize,
}

impl Deref for BufWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.as_slice()[..self.len]
    }
}

impl DerefMut for BufWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.guard.as_mut_slice()[..len]
    }
}

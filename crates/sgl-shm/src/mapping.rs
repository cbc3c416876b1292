//! Raw backings for [`Segment`](crate::Segment).

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use crate::error::{Result, ShmError};

pub(crate) enum Backing {
    Shm(ShmMapping),
    /// Word-aligned heap memory; every byte lives inside an atomic, so shared
    /// writes through the base pointer are sound.
    Heap(Box<[AtomicU64]>),
}

impl Backing {
    pub(crate) fn heap(size: usize) -> Self {
        let words = size.div_ceil(8).max(1);
        Backing::Heap((0..words).map(|_| AtomicU64::new(0)).collect())
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        match self {
            Backing::Shm(mapping) => mapping.ptr,
            Backing::Heap(words) => NonNull::from(&**words).cast::<u8>(),
        }
    }
}

/// A `MAP_SHARED` mapping of a POSIX shared memory object.
pub(crate) struct ShmMapping {
    ptr: NonNull<u8>,
    len: usize,
    path: CString,
    /// Set on the host mapping: holds the exclusive `flock` that marks the
    /// object as served, and unlinks the name on drop.
    owner: Option<File>,
}

/// `shm_open` wants a single path component with a leading slash.
pub(crate) fn shm_path(name: &str) -> Result<CString> {
    let invalid = || ShmError::InvalidName {
        name: name.to_string(),
    };
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') || bare.len() > 250 {
        return Err(invalid());
    }
    CString::new(format!("/{bare}")).map_err(|_| invalid())
}

fn shm_open(path: &CStr, flags: libc::c_int) -> io::Result<File> {
    // SAFETY: `path` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::shm_open(path.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by `shm_open` and has no other owner.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Takes the host's exclusive lock on `file`. `Ok(false)` if another open
/// description already holds it.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: `file` owns a valid descriptor for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

fn map(file: &File, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of `len` bytes of an open descriptor.
    // The result is checked against MAP_FAILED before use.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}

impl ShmMapping {
    /// Creates the object, or reclaims one left behind by a host that is gone,
    /// if it has the expected size. An object whose host still runs is
    /// [`ShmError::InUse`]. The returned mapping unlinks the name when
    /// dropped.
    pub(crate) fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let path = shm_path(name)?;
        let open_err = |source| ShmError::Open {
            name: name.to_string(),
            source,
        };

        let file = match shm_open(&path, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                shm_open(&path, libc::O_RDWR).map_err(open_err)?
            }
            Err(err) => return Err(open_err(err)),
        };

        let existing = file.metadata().map_err(open_err)?.len();
        if existing == 0 {
            file.set_len(size as u64).map_err(|source| ShmError::Resize {
                name: name.to_string(),
                source,
            })?;
        } else if existing != size as u64 {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: size as u64,
                found: existing,
            });
        }
        // Held for as long as a host serves the object, released by the kernel
        // when that host exits for any reason.
        if !try_lock_exclusive(&file).map_err(open_err)? {
            return Err(ShmError::InUse {
                name: name.to_string(),
            });
        }

        let ptr = map(&file, size).map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            ptr,
            len: size,
            path,
            owner: Some(file),
        })
    }

    /// Attaches to an existing object; the mapping covers its full size.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let path = shm_path(name)?;
        let open_err = |source| ShmError::Open {
            name: name.to_string(),
            source,
        };
        let file = shm_open(&path, libc::O_RDWR).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len() as usize;
        if len < sgl_protocol::layout::MIN_SEGMENT_BYTES {
            return Err(ShmError::TooSmall {
                size: len,
                min: sgl_protocol::layout::MIN_SEGMENT_BYTES,
            });
        }
        let ptr = map(&file, len).map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            ptr,
            len,
            path,
            owner: None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a live mapping created by `map`, and the
        // owning `Segment` hands out no references that outlive it.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        if self.owner.is_some() {
            // SAFETY: `path` is NUL-terminated.
            unsafe {
                libc::shm_unlink(self.path.as_ptr());
            }
        }
    }
}

//! Named shared-memory regions.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};

use crate::layout::{BLOB_HEADER_LEN, BlobHeader};
use crate::ShmError;

/// Longest logical name accepted for a region.
pub const MAX_NAME_LEN: usize = 200;

/// Check that `name` can be used as a region name.
///
/// Logical names map to the POSIX object `/<name>`, so they must be non-empty
/// and contain neither `/` nor NUL.
pub fn validate_name(name: &str) -> Result<(), ShmError> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn os_name(name: &str) -> Result<CString, ShmError> {
    validate_name(name)?;
    CString::new(format!("/{}", name)).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// A mapped POSIX shared-memory object.
///
/// The handle that created the object is its owner: dropping it unmaps the
/// memory and unlinks the name, so later opens fail with
/// [`ShmError::NotFound`]. Handles obtained with [`ShmRegion::open_existing`]
/// only unmap.
///
/// Reads and writes go through raw pointers into memory that other processes
/// may touch at the same time. Callers synchronize access themselves (the
/// mailbox protocol holds a [`NamedMutex`](crate::NamedMutex), message stores
/// are written once before their id is published).
pub struct ShmRegion {
    /// Logical name (without the leading `/`).
    name: String,
    /// Name passed to `shm_open` / `shm_unlink`.
    os_name: CString,
    /// Base address of the mapping.
    base_addr: *mut u8,
    /// Size of the mapping.
    size: usize,
    /// Whether dropping this handle unlinks the name.
    owner: bool,
    /// The underlying descriptor (kept open).
    _file: File,
}

// SAFETY: the mapping is plain shared memory; access is synchronized by the
// callers as documented on the type.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl ShmRegion {
    /// Create a new region of `size` bytes, failing if the name is taken.
    ///
    /// The memory is zero-filled.
    pub fn create_new(name: &str, size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be non-zero",
            )));
        }
        let os_name = os_name(name)?;

        // SAFETY: os_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                os_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => ShmError::AlreadyExists(name.to_string()),
                _ => ShmError::Io(err),
            });
        }

        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };

        let mapped = file
            .set_len(size as u64)
            .map_err(ShmError::Io)
            .and_then(|()| map(&file, size));
        let base_addr = match mapped {
            Ok(addr) => addr,
            Err(e) => {
                // SAFETY: os_name is valid; we created this object above.
                unsafe {
                    libc::shm_unlink(os_name.as_ptr());
                }
                return Err(e);
            }
        };

        tracing::trace!(name, size, "created shm region");

        Ok(Self {
            name: name.to_string(),
            os_name,
            base_addr,
            size,
            owner: true,
            _file: file,
        })
    }

    /// Open an existing region by name.
    ///
    /// A region whose creator has not sized it yet is reported as not found.
    pub fn open_existing(name: &str) -> Result<Self, ShmError> {
        let os_name = os_name(name)?;

        // SAFETY: os_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(os_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => ShmError::NotFound(name.to_string()),
                _ => ShmError::Io(err),
            });
        }

        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };
        let size = file.metadata().map_err(ShmError::Io)?.len() as usize;
        if size == 0 {
            return Err(ShmError::NotFound(name.to_string()));
        }

        let base_addr = map(&file, size)?;

        tracing::trace!(name, size, "opened shm region");

        Ok(Self {
            name: name.to_string(),
            os_name,
            base_addr,
            size,
            owner: false,
            _file: file,
        })
    }

    /// Whether a region with this name currently exists.
    pub fn exists(name: &str) -> Result<bool, ShmError> {
        let os_name = os_name(name)?;

        // SAFETY: os_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(os_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                // Exists but belongs to someone we may not open.
                Some(libc::EACCES) => Ok(true),
                _ => Err(ShmError::Io(err)),
            };
        }
        // SAFETY: fd is a valid descriptor we own.
        unsafe {
            libc::close(fd);
        }
        Ok(true)
    }

    /// Remove a region name. Returns `false` if it did not exist.
    ///
    /// Processes that still map the region keep their mapping.
    pub fn unlink(name: &str) -> Result<bool, ShmError> {
        let os_name = os_name(name)?;

        // SAFETY: os_name is a valid NUL-terminated string.
        let rc = unsafe { libc::shm_unlink(os_name.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                _ => Err(ShmError::Io(err)),
            };
        }
        tracing::trace!(name, "unlinked shm region");
        Ok(true)
    }

    /// Logical name of the region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this handle unlinks the name.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base_addr
    }

    /// Largest payload [`write_blob`](Self::write_blob) accepts.
    pub fn blob_capacity(&self) -> usize {
        self.size
            .saturating_sub(BLOB_HEADER_LEN)
            .min(u32::MAX as usize)
    }

    /// Write `payload` framed by a header carrying `magic`.
    ///
    /// The payload is copied before the header so a reader that validates the
    /// header never sees a length covering bytes not yet written.
    ///
    /// # Safety
    ///
    /// No other thread or process may read or write this region concurrently.
    pub unsafe fn write_blob(&self, magic: &[u8; 8], payload: &[u8]) -> Result<(), ShmError> {
        let capacity = self.blob_capacity();
        if payload.len() > capacity {
            return Err(ShmError::TooLarge {
                len: payload.len(),
                capacity,
            });
        }

        let header = BlobHeader::new(*magic, payload.len() as u32).to_bytes();
        // SAFETY: both ranges lie inside the mapping (checked against the
        // capacity above); exclusive access is the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base_addr.add(BLOB_HEADER_LEN),
                payload.len(),
            );
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.base_addr, BLOB_HEADER_LEN);
        }
        Ok(())
    }

    /// Read the payload framed by a header carrying `magic`.
    ///
    /// # Safety
    ///
    /// No other thread or process may write this region concurrently.
    pub unsafe fn read_blob(&self, magic: &[u8; 8]) -> Result<Vec<u8>, ShmError> {
        if self.size < BLOB_HEADER_LEN {
            return Err(crate::LayoutError::Truncated {
                len: BLOB_HEADER_LEN,
                available: self.size,
            }
            .into());
        }

        let mut raw = [0u8; BLOB_HEADER_LEN];
        // SAFETY: the mapping is at least BLOB_HEADER_LEN bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_addr, raw.as_mut_ptr(), BLOB_HEADER_LEN);
        }
        let header = BlobHeader::from_bytes(&raw);
        header.validate(magic, self.blob_capacity())?;

        let len = header.len as usize;
        let mut payload = vec![0u8; len];
        // SAFETY: validate() checked that len fits in the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_addr.add(BLOB_HEADER_LEN),
                payload.as_mut_ptr(),
                len,
            );
        }
        Ok(payload)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: base_addr and size were valid when created.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
        if self.owner {
            // SAFETY: os_name is a valid NUL-terminated string.
            let rc = unsafe { libc::shm_unlink(self.os_name.as_ptr()) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    tracing::warn!(name = %self.name, error = %err, "failed to unlink shm region");
                }
            } else {
                tracing::trace!(name = %self.name, "released shm region");
            }
        }
    }
}

fn map(file: &File, size: usize) -> Result<*mut u8, ShmError> {
    // SAFETY: the descriptor is valid and sized to at least `size` bytes.
    let base_addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if base_addr == libc::MAP_FAILED {
        return Err(ShmError::Io(io::Error::last_os_error()));
    }

    Ok(base_addr as *mut u8)
}

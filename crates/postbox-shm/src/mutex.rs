//! Named, process-shared, robust mutexes.
//!
//! A [`NamedMutex`] is a `pthread_mutex_t` initialized with
//! `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`, stored in its own
//! [`ShmRegion`]. Any process that knows the name can open it and take the
//! lock with a bounded wait. If a holder dies, the next locker recovers the
//! mutex instead of waiting forever.

use std::io;
use std::marker::PhantomData;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::{LayoutError, ShmError, ShmRegion, realtime_deadline};

/// Magic bytes identifying a mutex region.
const MUTEX_MAGIC: [u8; 8] = *b"PBXMUTEX";

/// Set once the pthread mutex has been initialized.
const READY: u32 = 1;

/// In-memory layout of a mutex region.
#[repr(C)]
struct MutexCell {
    magic: [u8; 8],
    version: u32,
    ready: AtomicU32,
    mutex: libc::pthread_mutex_t,
}

/// A robust process-shared mutex addressed by name.
pub struct NamedMutex {
    region: ShmRegion,
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("name", &self.region.name())
            .field("owner", &self.region.is_owner())
            .finish()
    }
}

impl NamedMutex {
    /// Create and initialize a new mutex, failing if the name is taken.
    ///
    /// The returned handle owns the name and unlinks it on drop.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let region = ShmRegion::create_new(name, std::mem::size_of::<MutexCell>())?;
        let cell = region.as_ptr() as *mut MutexCell;

        // SAFETY: the region is freshly created, zero-filled, page aligned and
        // large enough for a MutexCell. Nobody can lock it before `ready` is
        // published below.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            let configured = check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|()| {
                check(libc::pthread_mutexattr_setrobust(
                    &mut attr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|()| check(libc::pthread_mutex_init(addr_of_mut!((*cell).mutex), &attr)));
            libc::pthread_mutexattr_destroy(&mut attr);
            configured?;

            (*cell).magic = MUTEX_MAGIC;
            (*cell).version = crate::layout::LAYOUT_VERSION;
            (*cell).ready.store(READY, Ordering::Release);
        }

        tracing::debug!(name, "created named mutex");
        Ok(Self { region })
    }

    /// Open an existing mutex by name.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let region = ShmRegion::open_existing(name)?;
        if region.size() < std::mem::size_of::<MutexCell>() {
            return Err(LayoutError::Truncated {
                len: std::mem::size_of::<MutexCell>(),
                available: region.size(),
            }
            .into());
        }

        let cell = region.as_ptr() as *const MutexCell;
        // SAFETY: the region is at least size_of::<MutexCell>() bytes and page
        // aligned; `ready` is only ever accessed atomically.
        let ready = unsafe { (*cell).ready.load(Ordering::Acquire) };
        if ready != READY {
            // The creator has not finished initializing it.
            return Err(ShmError::NotFound(name.to_string()));
        }
        // SAFETY: magic is written before `ready` is published with Release.
        if unsafe { (*cell).magic } != MUTEX_MAGIC {
            return Err(LayoutError::InvalidMagic.into());
        }

        Ok(Self { region })
    }

    /// Name of the mutex region.
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Wait at most `wait` for the lock.
    ///
    /// Returns `Ok(None)` if the wait timed out. The wait is a real timed lock
    /// (`pthread_mutex_timedlock`), not a spin.
    pub fn try_lock_for(&self, wait: Duration) -> Result<Option<MutexGuard<'_>>, ShmError> {
        let deadline = realtime_deadline(wait);

        // SAFETY: the mutex was initialized by the creator before `ready` was
        // published, which `open`/`create` checked.
        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw(), &deadline) };
        match rc {
            0 => Ok(Some(MutexGuard {
                mutex: self,
                recovered: false,
                _not_send: PhantomData,
            })),
            libc::ETIMEDOUT => Ok(None),
            libc::EOWNERDEAD => {
                // The previous holder died while holding the lock. We own it
                // now; mark it usable again.
                // SAFETY: we hold the mutex (EOWNERDEAD grants ownership).
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
                if rc != 0 {
                    // SAFETY: we hold the mutex.
                    unsafe {
                        libc::pthread_mutex_unlock(self.raw());
                    }
                    return Err(ShmError::Io(io::Error::from_raw_os_error(rc)));
                }
                tracing::warn!(name = %self.name(), "recovered mutex abandoned by a dead holder");
                Ok(Some(MutexGuard {
                    mutex: self,
                    recovered: true,
                    _not_send: PhantomData,
                }))
            }
            err => Err(ShmError::Io(io::Error::from_raw_os_error(err))),
        }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        let cell = self.region.as_ptr() as *mut MutexCell;
        // SAFETY: the region holds a MutexCell; we only form a raw pointer.
        unsafe { addr_of_mut!((*cell).mutex) }
    }
}

/// Holds a [`NamedMutex`] until dropped.
///
/// A robust mutex can only be unlocked by the thread that locked it, so the
/// guard is neither `Send` nor `Sync`:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<postbox_shm::MutexGuard<'static>>();
/// ```
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a NamedMutex,
    recovered: bool,
    _not_send: PhantomData<*const ()>,
}

impl MutexGuard<'_> {
    /// Whether this acquisition recovered the lock from a dead holder.
    ///
    /// Data guarded by the mutex may have been left half-written.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw()) };
        if rc != 0 {
            tracing::error!(
                name = %self.mutex.name(),
                error = %io::Error::from_raw_os_error(rc),
                "failed to release named mutex"
            );
            debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed");
        }
    }
}

fn check(rc: libc::c_int) -> Result<(), ShmError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::Io(io::Error::from_raw_os_error(rc)))
    }
}

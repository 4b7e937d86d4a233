//! Named shared-memory primitives for brokerless IPC.
//!
//! This crate provides the OS substrate the mailbox protocol is built on:
//!
//! - [`ShmRegion`]: a POSIX shared-memory object (`shm_open` + `mmap`) addressed
//!   by a human-readable name. The process that creates a region owns it and
//!   unlinks the name when the handle is dropped.
//! - [`NamedMutex`]: a process-shared, robust `pthread_mutex_t` living in its own
//!   named region, acquired with a bounded wait (`pthread_mutex_timedlock`).
//! - [`layout`]: the framed blob header written at the start of a region.
//! - [`monotonic_millis`]: the host-wide monotonic clock used to age messages.
//!
//! The crate knows nothing about mailboxes or commands.
//!
//! # Platform
//!
//! Linux. Robust process-shared mutexes with a timed lock are not available on
//! every Unix.

#![forbid(unsafe_op_in_unsafe_fn)]

mod clock;
mod error;
pub mod layout;
mod mutex;
mod region;

pub use clock::{monotonic_millis, realtime_deadline};
pub use error::{LayoutError, ShmError};
pub use layout::{BLOB_HEADER_LEN, BlobHeader};
pub use mutex::{MutexGuard, NamedMutex};
pub use region::{MAX_NAME_LEN, ShmRegion, validate_name};

//! Mailbox regions and their mutexes.
//!
//! A mailbox is a fixed-capacity region named after its owner's identity,
//! holding one serialized [`MailboxState`]. It is guarded by a named mutex
//! called `<identity>_mutex_lock`. Every read-modify-write of the state
//! happens inside one critical section obtained through [`Mailbox::lock`].

use std::time::Duration;

use postbox_shm::{BLOB_HEADER_LEN, MutexGuard, NamedMutex, ShmError, ShmRegion};

use crate::codec::{self, Codec, WireCodec};
use crate::{Identity, IpcError, MailboxState};

/// Magic bytes identifying a mailbox region.
pub const MAILBOX_MAGIC: [u8; 8] = *b"PBXMBOX\0";

/// A mailbox, either owned (created by this process) or opened as a peer's.
#[derive(Debug)]
pub struct Mailbox {
    identity: Identity,
    // Dropped before the mutex so the name disappears first.
    region: ShmRegion,
    mutex: NamedMutex,
}

impl Mailbox {
    /// Create the mailbox for `identity`, holding an empty state.
    ///
    /// Fails with [`IpcError::DuplicateIdentity`] if a mailbox or a mailbox
    /// mutex with this name already exists. Another initializer may be
    /// holding that mutex, so it is never replaced here; leftovers of a dead
    /// process are cleared with [`Mailbox::remove_stale`].
    pub fn create(identity: &Identity, capacity: usize) -> Result<Self, IpcError> {
        let mailbox_name = identity.mailbox_name();
        if ShmRegion::exists(mailbox_name)? {
            return Err(IpcError::DuplicateIdentity(identity.to_string()));
        }

        let mutex_name = identity.mutex_name();
        let mutex = match NamedMutex::create(&mutex_name) {
            Ok(mutex) => mutex,
            Err(ShmError::AlreadyExists(_)) => {
                tracing::debug!(mutex = %mutex_name, "mailbox mutex already exists");
                return Err(IpcError::DuplicateIdentity(identity.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        // Hold the lock while the region comes into existence so a sender that
        // finds the region cannot read it before the empty state is written.
        let guard = mutex
            .try_lock_for(Duration::ZERO)?
            .ok_or_else(|| IpcError::DuplicateIdentity(identity.to_string()))?;

        let region = match ShmRegion::create_new(mailbox_name, BLOB_HEADER_LEN + capacity) {
            Ok(region) => region,
            Err(ShmError::AlreadyExists(_)) => {
                return Err(IpcError::DuplicateIdentity(identity.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        write_state(identity, &region, &MailboxState::default())?;
        drop(guard);

        tracing::debug!(
            identity = %identity,
            capacity,
            codec = WireCodec::NAME,
            "created mailbox"
        );

        Ok(Self {
            identity: identity.clone(),
            region,
            mutex,
        })
    }

    /// Open an existing mailbox, typically a peer's.
    pub fn open(identity: &Identity) -> Result<Self, IpcError> {
        let not_found = |e: ShmError| match e {
            ShmError::NotFound(_) => IpcError::MailboxNotFound(identity.to_string()),
            other => IpcError::Shm(other),
        };
        let region = ShmRegion::open_existing(identity.mailbox_name()).map_err(not_found)?;
        let mutex = NamedMutex::open(&identity.mutex_name()).map_err(not_found)?;
        Ok(Self {
            identity: identity.clone(),
            region,
            mutex,
        })
    }

    /// Remove a mailbox and its mutex left behind by a process that died.
    ///
    /// Returns whether anything was removed. Only call this when the owner is
    /// known to be gone.
    pub fn remove_stale(identity: &Identity) -> Result<bool, IpcError> {
        let mailbox = ShmRegion::unlink(identity.mailbox_name())?;
        let mutex = ShmRegion::unlink(&identity.mutex_name())?;
        Ok(mailbox || mutex)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Largest serialized state the mailbox holds.
    pub fn capacity(&self) -> usize {
        self.region.blob_capacity()
    }

    /// Whether this handle created the mailbox.
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// Enter the critical section, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when the wait timed out.
    pub fn lock(&self, wait: Duration) -> Result<Option<MailboxGuard<'_>>, IpcError> {
        let Some(guard) = self.mutex.try_lock_for(wait)? else {
            return Ok(None);
        };
        if guard.recovered() {
            tracing::warn!(
                identity = %self.identity,
                "mailbox lock recovered from a dead holder; state may be stale"
            );
        }
        Ok(Some(MailboxGuard {
            mailbox: self,
            _guard: guard,
        }))
    }
}

/// Exclusive access to a mailbox state.
///
/// Not `Send`: the lock is released on the thread that took it.
pub struct MailboxGuard<'a> {
    mailbox: &'a Mailbox,
    _guard: MutexGuard<'a>,
}

impl MailboxGuard<'_> {
    /// Serialized bytes of the state currently in the mailbox.
    pub fn read_raw(&self) -> Result<Vec<u8>, IpcError> {
        // SAFETY: writers hold the mailbox mutex, which this guard holds.
        Ok(unsafe { self.mailbox.region.read_blob(&MAILBOX_MAGIC)? })
    }

    /// Read and decode the state.
    pub fn read_state(&self) -> Result<MailboxState, IpcError> {
        codec::decode("mailbox state", &self.read_raw()?)
    }

    /// Encode and write back the state.
    ///
    /// Fails with [`IpcError::MailboxOverflow`] if it does not fit; the
    /// mailbox is left unchanged in that case.
    pub fn write_state(&mut self, state: &MailboxState) -> Result<(), IpcError> {
        write_state(&self.mailbox.identity, &self.mailbox.region, state)
    }
}

fn write_state(
    identity: &Identity,
    region: &ShmRegion,
    state: &MailboxState,
) -> Result<(), IpcError> {
    let bytes = codec::encode("mailbox state", state)?;
    // SAFETY: callers hold the mailbox mutex.
    unsafe { region.write_blob(&MAILBOX_MAGIC, &bytes) }.map_err(|e| match e {
        ShmError::TooLarge { len, capacity } => IpcError::MailboxOverflow {
            mailbox: identity.to_string(),
            needed: len,
            capacity,
        },
        other => IpcError::Shm(other),
    })
}

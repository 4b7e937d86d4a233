//! Message stores: one region per message, holding its serialized envelope.
//!
//! The sender creates the store, keeps the owning handle in its [`Outbox`]
//! and releases it once the receiver has consumed the message or the message
//! has timed out. The receiver only ever opens a store read-only by id.

use std::collections::HashMap;

use postbox_shm::{BLOB_HEADER_LEN, ShmError, ShmRegion};

use crate::{IpcError, MessageId};

/// Magic bytes identifying a message store region.
pub const STORE_MAGIC: [u8; 8] = *b"PBXSTORE";

/// An owned message store region.
#[derive(Debug)]
pub struct MessageStore {
    id: MessageId,
    region: ShmRegion,
}

impl MessageStore {
    /// Create the store for `id` holding `bytes`, sized to fit exactly.
    ///
    /// Fails with [`ShmError::AlreadyExists`] (wrapped) if the id collides.
    pub fn create(id: MessageId, bytes: &[u8]) -> Result<Self, IpcError> {
        let region = ShmRegion::create_new(&id.store_name(), BLOB_HEADER_LEN + bytes.len())?;
        // SAFETY: the region was just created and its id is not yet published.
        unsafe { region.write_blob(&STORE_MAGIC, bytes)? };
        Ok(Self { id, region })
    }

    /// Read the envelope bytes of a store created by another process.
    pub fn read(id: MessageId) -> Result<Vec<u8>, IpcError> {
        let region = ShmRegion::open_existing(&id.store_name()).map_err(|e| match e {
            ShmError::NotFound(_) => IpcError::MessageStoreNotFound(id),
            other => IpcError::Shm(other),
        })?;
        // SAFETY: stores are written once, before their id is published.
        Ok(unsafe { region.read_blob(&STORE_MAGIC)? })
    }

    /// Whether the store for `id` still exists.
    pub fn exists(id: MessageId) -> Result<bool, IpcError> {
        Ok(ShmRegion::exists(&id.store_name())?)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Size of the serialized envelope.
    pub fn len(&self) -> usize {
        self.region.blob_capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct OutboxEntry {
    store: MessageStore,
    created_at: u64,
    published: bool,
}

/// The sender-side table of live message stores.
///
/// A store enters unpublished, becomes published once its descriptor is in
/// the receiver's mailbox, and leaves when released. Dropping an entry
/// unlinks its region.
#[derive(Default)]
pub struct Outbox {
    entries: HashMap<MessageId, OutboxEntry>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly created store.
    pub fn insert(&mut self, store: MessageStore, now: u64) {
        self.entries.insert(
            store.id(),
            OutboxEntry {
                store,
                created_at: now,
                published: false,
            },
        );
    }

    pub fn mark_published(&mut self, id: MessageId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.published = true;
        }
    }

    /// Release the store for `id`. Returns whether it was tracked.
    pub fn release(&mut self, id: MessageId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Release stores whose descriptor never reached a mailbox and that are
    /// older than `timeout_millis`.
    pub fn sweep_unpublished(&mut self, now: u64, timeout_millis: u64) -> Vec<MessageId> {
        let stale: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.published && now.saturating_sub(e.created_at) > timeout_millis)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids of all live stores, sorted.
    pub fn ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

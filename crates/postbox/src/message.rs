//! Message ids, descriptors and the mailbox state blob.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Identity;

/// Globally unique message id (random 128-bit UUID).
///
/// Its canonical hyphenated text form names the message store region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Name of the message store region for this id.
    pub fn store_name(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Metadata published into a mailbox for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDescriptor {
    pub id: MessageId,
    /// Host monotonic clock at publish time.
    pub created_at_monotonic_millis: u64,
    pub command_name: String,
    pub sender_identity: Identity,
}

impl MessageDescriptor {
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at_monotonic_millis)
    }

    pub fn is_expired(&self, now: u64, timeout_millis: u64) -> bool {
        self.age_millis(now) > timeout_millis
    }

    pub fn is_from(&self, sender: &Identity) -> bool {
        &self.sender_identity == sender
    }
}

/// Contents of one mailbox.
///
/// A descriptor lives in at most one of the two lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxState {
    /// Sent, possibly not yet read.
    #[serde(default)]
    pub outstanding: Vec<MessageDescriptor>,
    /// Read, not yet purged by the sender.
    #[serde(default)]
    pub consumed: Vec<MessageDescriptor>,
}

impl MailboxState {
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty() && self.consumed.is_empty()
    }

    /// Append a freshly sent descriptor.
    pub fn publish(&mut self, descriptor: MessageDescriptor) {
        self.outstanding.push(descriptor);
    }

    /// Remove `sender`'s outstanding descriptors older than the timeout.
    ///
    /// Returns the removed ids so the sender can release their stores.
    pub fn prune_expired(
        &mut self,
        sender: &Identity,
        now: u64,
        timeout_millis: u64,
    ) -> Vec<MessageId> {
        let mut removed = Vec::new();
        self.outstanding.retain(|d| {
            if d.is_from(sender) && d.is_expired(now, timeout_millis) {
                removed.push(d.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove `sender`'s consumed descriptors.
    ///
    /// Returns the removed ids so the sender can release their stores.
    pub fn prune_acknowledged(&mut self, sender: &Identity) -> Vec<MessageId> {
        let mut removed = Vec::new();
        self.consumed.retain(|d| {
            if d.is_from(sender) {
                removed.push(d.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Take every outstanding descriptor, leaving `outstanding` empty.
    ///
    /// The caller hands each one back through [`consume`](Self::consume)
    /// before the state is written back.
    pub fn take_outstanding(&mut self) -> Vec<MessageDescriptor> {
        std::mem::take(&mut self.outstanding)
    }

    /// Record a drained descriptor as consumed.
    pub fn consume(&mut self, descriptor: MessageDescriptor) {
        self.consumed.push(descriptor);
    }

    /// No id appears in both lists.
    pub fn is_consistent(&self) -> bool {
        self.outstanding
            .iter()
            .all(|o| !self.consumed.iter().any(|c| c.id == o.id))
    }

    pub fn outstanding_ids(&self) -> Vec<MessageId> {
        self.outstanding.iter().map(|d| d.id).collect()
    }

    pub fn consumed_ids(&self) -> Vec<MessageId> {
        self.consumed.iter().map(|d| d.id).collect()
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use postbox_shm::ShmError;

use crate::MessageId;

/// Errors raised by the mailbox protocol.
#[derive(Debug)]
pub enum IpcError {
    /// Another live participant already owns a mailbox with this name.
    DuplicateIdentity(String),
    /// The serialized mailbox state does not fit in the mailbox.
    MailboxOverflow {
        mailbox: String,
        needed: usize,
        capacity: usize,
    },
    /// The target identity was never registered as a peer.
    UnknownPeer(String),
    /// The peer was already registered.
    PeerAlreadyExists(String),
    /// The peer is registered but its mailbox region does not exist.
    MailboxNotFound(String),
    /// The mailbox mutex could not be acquired within the bounded wait.
    MailboxLockTimeout { mailbox: String, waited: Duration },
    /// The message store was already reclaimed by its sender.
    MessageStoreNotFound(MessageId),
    /// No handler is registered for an inbound command.
    CommandNotRegistered(String),
    /// A handler for this command is already registered.
    CommandAlreadyRegistered(String),
    /// Unregistering a command that is not registered.
    CommandNotFound(String),
    /// The command name is reserved for the protocol itself.
    ReservedCommand(String),
    /// A caller-supplied argument is unusable.
    InvalidArgument(String),
    /// Encoding or decoding a payload, envelope or mailbox failed.
    Serialization {
        context: &'static str,
        message: String,
    },
    /// A command handler returned an error or panicked.
    Handler { command: String, message: String },
    /// Shared-memory failure.
    Shm(ShmError),
}

impl IpcError {
    pub(crate) fn serialization(context: &'static str, err: impl fmt::Display) -> Self {
        Self::Serialization {
            context,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIdentity(name) => write!(f, "identity already in use: {}", name),
            Self::MailboxOverflow {
                mailbox,
                needed,
                capacity,
            } => write!(
                f,
                "mailbox {} overflow: state needs {} bytes, capacity is {}",
                mailbox, needed, capacity
            ),
            Self::UnknownPeer(name) => write!(f, "unknown peer: {}", name),
            Self::PeerAlreadyExists(name) => write!(f, "peer already registered: {}", name),
            Self::MailboxNotFound(name) => write!(f, "mailbox not found: {}", name),
            Self::MailboxLockTimeout { mailbox, waited } => write!(
                f,
                "timed out after {:?} waiting for mailbox lock {}",
                waited, mailbox
            ),
            Self::MessageStoreNotFound(id) => write!(f, "message store not found: {}", id),
            Self::CommandNotRegistered(name) => write!(f, "command not registered: {}", name),
            Self::CommandAlreadyRegistered(name) => {
                write!(f, "command already registered: {}", name)
            }
            Self::CommandNotFound(name) => write!(f, "command not found: {}", name),
            Self::ReservedCommand(name) => write!(f, "command name is reserved: {}", name),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {}", message),
            Self::Serialization { context, message } => {
                write!(f, "serialization error ({}): {}", context, message)
            }
            Self::Handler { command, message } => {
                write!(f, "handler for {} failed: {}", command, message)
            }
            Self::Shm(e) => write!(f, "shared memory error: {}", e),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for IpcError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

/// Where a reported error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    AddPeer,
    Register,
    Unregister,
    Send,
    Receive,
    /// Dispatching one drained descriptor to its handler.
    Dispatch,
    /// Sending the acknowledgements owed after a drain.
    Ack,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AddPeer => "add_peer",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Dispatch => "dispatch",
            Self::Ack => "ack",
        };
        f.write_str(s)
    }
}

/// Caller-supplied sink for every error after initialization.
pub type ErrorCallback = Arc<dyn Fn(ErrorSource, &IpcError) + Send + Sync>;

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_subject() {
        let err = IpcError::MailboxOverflow {
            mailbox: "svcB".into(),
            needed: 2048,
            capacity: 1024,
        };
        let s = err.to_string();
        assert!(s.contains("svcB"));
        assert!(s.contains("2048"));

        let err = IpcError::UnknownPeer("svcC".into());
        assert_eq!(err.to_string(), "unknown peer: svcC");
    }

    #[test]
    fn shm_errors_chain_their_source() {
        use std::error::Error;
        let err = IpcError::from(ShmError::NotFound("x".into()));
        assert!(err.source().is_some());
    }
}

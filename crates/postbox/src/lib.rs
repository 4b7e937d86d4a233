#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod codec;
mod config;
mod controller;
mod envelope;
mod error;
mod identity;
pub mod mailbox;
mod message;
pub mod registry;
mod sink;
pub mod store;

pub use config::{
    ControllerConfig, DEFAULT_MAILBOX_CAPACITY, ENV_MAILBOX_CAPACITY, ENV_MUTEX_WAIT_MS,
    ENV_RECEIVE_TIMEOUT_MS, ENV_REPORT_LOCK_TIMEOUTS, MUTEX_WAIT, RECEIVE_DATA_TIMEOUT,
};
pub use controller::{Controller, ControllerBuilder, DrainSummary};
pub use envelope::{ACK_COMMAND, Ack, CommandEnvelope};
pub use error::{ErrorCallback, ErrorSource, HandlerError, IpcError};
pub use identity::{FixedSuffix, Identity, LoginSession, MUTEX_SUFFIX, NoSuffix, SessionSuffix};
pub use mailbox::{Mailbox, MailboxGuard};
pub use message::{MailboxState, MessageDescriptor, MessageId};
pub use registry::{AckObserver, CommandRegistry};
pub use sink::{DiagnosticSink, IPC_AREA, TracingSink};
pub use store::{MessageStore, Outbox};

// Re-export the substrate for callers that inspect regions directly.
pub use postbox_shm;

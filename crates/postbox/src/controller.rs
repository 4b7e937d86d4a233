//! The controller: one participant's mailbox, peers, registry and the
//! send/receive algorithms.
//!
//! All operations are synchronous and run on the caller's thread. The only
//! suspension point is the bounded wait for a mailbox mutex.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use postbox_shm::{ShmError, monotonic_millis};

use crate::{
    ACK_COMMAND, Ack, CommandEnvelope, CommandRegistry, ControllerConfig, DiagnosticSink,
    ErrorCallback, ErrorSource, HandlerError, IPC_AREA, Identity, IpcError, Mailbox, MailboxState,
    MessageDescriptor, MessageId, MessageStore, NoSuffix, Outbox, SessionSuffix, TracingSink,
};

/// Attempts at finding an unused message id before giving up.
const STORE_ID_ATTEMPTS: usize = 8;

/// Outcome of one [`Controller::receive`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// The mailbox lock could not be taken within the wait; nothing was read.
    pub contended: bool,
    /// Descriptors moved from outstanding to consumed.
    pub drained: usize,
    /// Descriptors whose handler ran and returned `Ok`.
    pub dispatched: usize,
    /// Descriptors skipped or whose handler failed.
    pub failed: usize,
    /// Acknowledgements delivered to senders.
    pub acks_sent: usize,
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    name: String,
    config: ControllerConfig,
    on_error: Option<ErrorCallback>,
    sink: Arc<dyn DiagnosticSink>,
    session: Box<dyn SessionSuffix>,
}

impl ControllerBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback receiving every error after initialization.
    ///
    /// Defaults to a `tracing::warn!` event per error.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(ErrorSource, &IpcError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Diagnostic sink called at send/receive milestones.
    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Provider of the session suffix, queried once by [`initialize`](Self::initialize).
    pub fn session_suffix(mut self, session: impl SessionSuffix + 'static) -> Self {
        self.session = Box::new(session);
        self
    }

    /// Create the mailbox and return the controller.
    ///
    /// Fails with [`IpcError::DuplicateIdentity`] if the (suffixed) name is
    /// already taken on this host.
    pub fn initialize(self) -> Result<Controller, IpcError> {
        self.config.validate()?;
        let suffix = self.session.suffix().filter(|s| !s.is_empty());
        let identity = Identity::new(self.name)?.with_suffix(suffix.as_deref())?;
        let mailbox = Mailbox::create(&identity, self.config.mailbox_capacity)?;

        let on_error: ErrorCallback = match self.on_error {
            Some(callback) => callback,
            None => Arc::new(|source: ErrorSource, err: &IpcError| {
                tracing::warn!(%source, error = %err, "ipc error");
            }),
        };

        tracing::info!(identity = %identity, "controller initialized");

        Ok(Controller {
            identity,
            suffix,
            config: self.config,
            mailbox,
            peers: Mutex::new(HashMap::new()),
            registry: RwLock::new(CommandRegistry::new()),
            outbox: Mutex::new(Outbox::new()),
            on_error,
            sink: self.sink,
        })
    }
}

/// One IPC participant.
///
/// Owns its mailbox and every message store it created; dropping the
/// controller unlinks them all. Share it across threads with `Arc`.
pub struct Controller {
    identity: Identity,
    suffix: Option<String>,
    config: ControllerConfig,
    mailbox: Mailbox,
    peers: Mutex<HashMap<String, Identity>>,
    registry: RwLock<CommandRegistry>,
    outbox: Mutex<Outbox>,
    on_error: ErrorCallback,
    sink: Arc<dyn DiagnosticSink>,
}

impl Controller {
    pub fn builder(name: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder {
            name: name.into(),
            config: ControllerConfig::default(),
            on_error: None,
            sink: Arc::new(TracingSink),
            session: Box::new(NoSuffix),
        }
    }

    /// Initialize with an explicit configuration and error callback.
    pub fn initialize<F>(
        name: impl Into<String>,
        config: ControllerConfig,
        on_error: F,
    ) -> Result<Self, IpcError>
    where
        F: Fn(ErrorSource, &IpcError) + Send + Sync + 'static,
    {
        Self::builder(name).config(config).on_error(on_error).initialize()
    }

    /// Unlink a mailbox and mutex left behind by a crashed process.
    pub fn remove_stale(name: &str) -> Result<bool, IpcError> {
        Mailbox::remove_stale(&Identity::new(name)?)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Record a peer this controller may send to.
    ///
    /// The session suffix is appended unless the name already carries it.
    /// Returns whether the peer was added; duplicates and invalid names are
    /// reported to the error callback.
    pub fn add_peer(&self, name: &str) -> bool {
        let identity = match self.suffixed(name) {
            Ok(identity) => identity,
            Err(e) => {
                self.report(ErrorSource::AddPeer, &e);
                return false;
            }
        };
        let mut peers = self.peers.lock();
        if peers.contains_key(identity.as_str()) {
            drop(peers);
            self.report(
                ErrorSource::AddPeer,
                &IpcError::PeerAlreadyExists(identity.to_string()),
            );
            return false;
        }
        tracing::debug!(peer = %identity, "added peer");
        peers.insert(identity.as_str().to_string(), identity);
        true
    }

    /// Known peers, sorted by name.
    pub fn peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.peers.lock().values().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_peer(&self, name: &str) -> bool {
        self.resolve_peer(name).is_some()
    }

    fn suffixed(&self, name: &str) -> Result<Identity, IpcError> {
        Identity::new(name)?.with_suffix(self.suffix.as_deref())
    }

    fn resolve_peer(&self, name: &str) -> Option<Identity> {
        let peers = self.peers.lock();
        if let Some(identity) = peers.get(name) {
            return Some(identity.clone());
        }
        let suffixed = self.suffixed(name).ok()?;
        peers.get(suffixed.as_str()).cloned()
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register `handler` for commands named `name`.
    pub fn register<P, F>(&self, name: impl Into<String>, handler: F) -> Result<(), IpcError>
    where
        P: serde::de::DeserializeOwned + 'static,
        F: Fn(&Identity, P) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let result = self.registry.write().register(name, handler);
        self.reported(ErrorSource::Register, result)
    }

    pub fn unregister(&self, name: &str) -> Result<(), IpcError> {
        let result = self.registry.write().unregister(name);
        self.reported(ErrorSource::Unregister, result)
    }

    /// Observe acknowledgements of messages this controller sent.
    pub fn on_ack<F>(&self, observer: F)
    where
        F: Fn(&Identity, Ack) + Send + Sync + 'static,
    {
        self.registry.read().set_ack_observer(Arc::new(observer));
    }

    /// Registered command names, sorted, including `Ack`.
    pub fn registered_commands(&self) -> Vec<String> {
        self.registry.read().names()
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Publish `envelope` into the mailbox of `peer`.
    ///
    /// Returns the new message id once the descriptor is in the peer's
    /// mailbox. Does not wait for the peer to read it.
    pub fn send(&self, envelope: &CommandEnvelope, peer: &str) -> Result<MessageId, IpcError> {
        let result = if envelope.is_ack() {
            Err(IpcError::ReservedCommand(ACK_COMMAND.to_string()))
        } else if envelope.command_name.trim().is_empty() {
            Err(IpcError::InvalidArgument("command name is empty".into()))
        } else {
            match self.resolve_peer(peer) {
                Some(peer) => self.publish(envelope, &peer),
                None => Err(IpcError::UnknownPeer(peer.to_string())),
            }
        };
        self.reported(ErrorSource::Send, result)
    }

    fn publish(&self, envelope: &CommandEnvelope, peer: &Identity) -> Result<MessageId, IpcError> {
        let timeout = self.config.receive_data_timeout_millis();

        let swept = self.outbox.lock().sweep_unpublished(monotonic_millis(), timeout);
        if !swept.is_empty() {
            self.log(format!("released {} unpublished message stores", swept.len()));
        }

        let mailbox = Mailbox::open(peer)?;
        let bytes = envelope.to_bytes()?;
        let id = self.create_store(&bytes)?;

        let Some(mut guard) = mailbox.lock(self.config.mutex_wait)? else {
            // The store stays in the outbox until it ages out.
            return Err(IpcError::MailboxLockTimeout {
                mailbox: peer.to_string(),
                waited: self.config.mutex_wait,
            });
        };

        let mut state = match guard.read_state() {
            Ok(state) => state,
            Err(e) => {
                drop(guard);
                self.outbox.lock().release(id);
                return Err(e);
            }
        };

        let now = monotonic_millis();
        let expired = state.prune_expired(&self.identity, now, timeout);
        let acknowledged = state.prune_acknowledged(&self.identity);
        let pruned = state.clone();

        state.publish(MessageDescriptor {
            id,
            created_at_monotonic_millis: now,
            command_name: envelope.command_name.clone(),
            sender_identity: self.identity.clone(),
        });

        if let Err(e) = guard.write_state(&state) {
            // Still hand back what this sender reclaimed, if that fits.
            let reclaimed = !(expired.is_empty() && acknowledged.is_empty())
                && guard.write_state(&pruned).is_ok();
            drop(guard);

            let mut outbox = self.outbox.lock();
            outbox.release(id);
            if reclaimed {
                for old in expired.iter().chain(&acknowledged) {
                    outbox.release(*old);
                }
            }
            return Err(e);
        }
        let published_len = state.outstanding.len();
        let consumed_len = state.consumed.len();
        drop(guard);

        {
            let mut outbox = self.outbox.lock();
            outbox.mark_published(id);
            for old in expired.iter().chain(&acknowledged) {
                outbox.release(*old);
            }
        }

        self.log(format!("sent {} {} to {}", envelope.command_name, id, peer));
        self.log(format!(
            "mailbox {}: {} outstanding, {} consumed, {} byte capacity",
            peer,
            published_len,
            consumed_len,
            mailbox.capacity()
        ));
        if !expired.is_empty() {
            self.log(format!(
                "reclaimed {} timed out messages from {}",
                expired.len(),
                peer
            ));
        }
        if !acknowledged.is_empty() {
            self.log(format!(
                "reclaimed {} acknowledged messages from {}",
                acknowledged.len(),
                peer
            ));
        }

        Ok(id)
    }

    fn create_store(&self, bytes: &[u8]) -> Result<MessageId, IpcError> {
        for _ in 0..STORE_ID_ATTEMPTS {
            let id = MessageId::new();
            match MessageStore::create(id, bytes) {
                Ok(store) => {
                    self.outbox.lock().insert(store, monotonic_millis());
                    return Ok(id);
                }
                Err(IpcError::Shm(ShmError::AlreadyExists(name))) => {
                    tracing::warn!(store = %name, "message id collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpcError::InvalidArgument(
            "could not allocate an unused message id".into(),
        ))
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Drain the local mailbox, dispatch each message and acknowledge it.
    ///
    /// Errors are reported to the callback and never abort the drain.
    pub fn receive(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();

        let mut guard = match self.mailbox.lock(self.config.mutex_wait) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                summary.contended = true;
                if self.config.report_lock_timeouts {
                    self.report(
                        ErrorSource::Receive,
                        &IpcError::MailboxLockTimeout {
                            mailbox: self.identity.to_string(),
                            waited: self.config.mutex_wait,
                        },
                    );
                }
                return summary;
            }
            Err(e) => {
                self.report(ErrorSource::Receive, &e);
                return summary;
            }
        };

        let (mut state, reset) = match guard.read_state() {
            Ok(state) => (state, false),
            Err(e) => {
                self.report(ErrorSource::Receive, &e);
                tracing::warn!(identity = %self.identity, "resetting unreadable mailbox");
                (MailboxState::default(), true)
            }
        };

        let pending = state.take_outstanding();
        if pending.is_empty() && !reset {
            return summary;
        }

        self.log(format!("draining {} messages", pending.len()));

        let mut owed: Vec<(Identity, Vec<MessageId>)> = Vec::new();
        for descriptor in pending {
            summary.drained += 1;
            match self.dispatch(&descriptor) {
                Ok(()) => summary.dispatched += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.report(ErrorSource::Dispatch, &e);
                }
            }
            if descriptor.command_name != ACK_COMMAND {
                match owed.iter_mut().find(|(s, _)| *s == descriptor.sender_identity) {
                    Some((_, ids)) => ids.push(descriptor.id),
                    None => owed.push((descriptor.sender_identity.clone(), vec![descriptor.id])),
                }
            }
            state.consume(descriptor);
        }

        if let Err(e) = guard.write_state(&state) {
            self.report(ErrorSource::Receive, &e);
        }
        drop(guard);

        self.log(format!(
            "drained {} messages, {} dispatched, {} failed",
            summary.drained, summary.dispatched, summary.failed
        ));

        if !owed.is_empty() {
            self.log(format!("sending acks to {} senders", owed.len()));
        }
        for (sender, ids) in owed {
            self.learn_peer(&sender);
            for id in ids {
                let result = Ack::envelope(id).and_then(|ack| self.publish(&ack, &sender));
                match result {
                    Ok(_) => summary.acks_sent += 1,
                    Err(e) => self.report(ErrorSource::Ack, &e),
                }
            }
        }
        if summary.acks_sent > 0 {
            self.log(format!("sent {} acks", summary.acks_sent));
        }

        summary
    }

    fn dispatch(&self, descriptor: &MessageDescriptor) -> Result<(), IpcError> {
        let bytes = MessageStore::read(descriptor.id)?;
        let envelope = CommandEnvelope::from_bytes(&bytes)?;

        let entry = self
            .registry
            .read()
            .lookup(&descriptor.command_name)
            .ok_or_else(|| IpcError::CommandNotRegistered(descriptor.command_name.clone()))?;

        let sender = &descriptor.sender_identity;
        match catch_unwind(AssertUnwindSafe(|| entry.invoke(sender, &envelope.payload))) {
            Ok(result) => result,
            Err(panic) => Err(IpcError::Handler {
                command: entry.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn learn_peer(&self, sender: &Identity) {
        let mut peers = self.peers.lock();
        if !peers.contains_key(sender.as_str()) {
            tracing::debug!(peer = %sender, "learned peer from inbound message");
            peers.insert(sender.as_str().to_string(), sender.clone());
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Ids of the message stores this controller still holds.
    pub fn pending_stores(&self) -> Vec<MessageId> {
        self.outbox.lock().ids()
    }

    /// Lock and read the local mailbox.
    pub fn mailbox_snapshot(&self) -> Result<MailboxState, IpcError> {
        let guard = self
            .mailbox
            .lock(self.config.mutex_wait)?
            .ok_or_else(|| IpcError::MailboxLockTimeout {
                mailbox: self.identity.to_string(),
                waited: self.config.mutex_wait,
            })?;
        guard.read_state()
    }

    fn report(&self, source: ErrorSource, err: &IpcError) {
        (self.on_error)(source, err);
    }

    fn reported<T>(&self, source: ErrorSource, result: Result<T, IpcError>) -> Result<T, IpcError> {
        if let Err(e) = &result {
            self.report(source, e);
        }
        result
    }

    fn log(&self, text: String) {
        self.sink.log(&text, IPC_AREA);
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("peers", &self.peers())
            .field("pending_stores", &self.outbox.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let pending = self.outbox.get_mut().len();
        tracing::debug!(identity = %self.identity, pending, "controller shutting down");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

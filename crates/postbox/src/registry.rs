//! Command registry: maps command names to typed handlers.
//!
//! Each entry knows how to reconstruct its command's payload from the
//! envelope and hands it, together with the sender identity, to the user's
//! handler. The built-in `Ack` command is always present and cannot be
//! registered, unregistered or replaced.
//!
//! # Example
//!
//! ```rust
//! use postbox::{CommandRegistry, Identity};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Ping {
//!     n: u32,
//! }
//!
//! let mut registry = CommandRegistry::new();
//! registry
//!     .register("Ping", |sender: &Identity, ping: Ping| {
//!         println!("ping {} from {}", ping.n, sender);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert!(registry.contains("Ping"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::{ACK_COMMAND, Ack, HandlerError, Identity, IpcError};

/// Maximum command name length in bytes.
pub const MAX_COMMAND_NAME_LEN: usize = 128;

type ErasedHandler =
    Box<dyn Fn(&Identity, &serde_json::Value) -> Result<(), IpcError> + Send + Sync>;

/// Observer for acknowledgements arriving at this controller.
pub type AckObserver = Arc<dyn Fn(&Identity, Ack) + Send + Sync>;

/// One registered command.
pub struct RegistryEntry {
    name: String,
    payload_type: &'static str,
    builtin: bool,
    handler: ErasedHandler,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the payload the handler expects.
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Decode `payload` and run the handler.
    pub fn invoke(&self, sender: &Identity, payload: &serde_json::Value) -> Result<(), IpcError> {
        (self.handler)(sender, payload)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("payload_type", &self.payload_type)
            .field("builtin", &self.builtin)
            .finish_non_exhaustive()
    }
}

/// Registered commands of one controller.
pub struct CommandRegistry {
    entries: HashMap<String, Arc<RegistryEntry>>,
    ack_observer: Arc<RwLock<Option<AckObserver>>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// A registry holding only the built-in `Ack`.
    pub fn new() -> Self {
        let ack_observer: Arc<RwLock<Option<AckObserver>>> = Arc::default();
        let observer = Arc::clone(&ack_observer);
        let ack = RegistryEntry {
            name: ACK_COMMAND.to_string(),
            payload_type: std::any::type_name::<Ack>(),
            builtin: true,
            handler: typed_handler(ACK_COMMAND, move |sender: &Identity, ack: Ack| {
                // Clone out so the observer runs without the lock held.
                let observer = observer.read().clone();
                if let Some(observer) = observer {
                    observer(sender, ack);
                }
                Ok(())
            }),
        };

        let mut entries = HashMap::new();
        entries.insert(ACK_COMMAND.to_string(), Arc::new(ack));
        Self {
            entries,
            ack_observer,
        }
    }

    /// Register `handler` for `name`.
    ///
    /// # Errors
    ///
    /// - [`IpcError::InvalidArgument`] if the name is blank or too long
    /// - [`IpcError::CommandAlreadyRegistered`] if the name is taken,
    ///   including the built-in `Ack`
    pub fn register<P, F>(&mut self, name: impl Into<String>, handler: F) -> Result<(), IpcError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(&Identity, P) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(IpcError::InvalidArgument("command name is empty".into()));
        }
        if name.len() > MAX_COMMAND_NAME_LEN {
            return Err(IpcError::InvalidArgument(format!(
                "command name exceeds {} bytes",
                MAX_COMMAND_NAME_LEN
            )));
        }
        if self.entries.contains_key(&name) {
            return Err(IpcError::CommandAlreadyRegistered(name));
        }

        let entry = RegistryEntry {
            handler: typed_handler(&name, handler),
            name: name.clone(),
            payload_type: std::any::type_name::<P>(),
            builtin: false,
        };
        self.entries.insert(name, Arc::new(entry));
        Ok(())
    }

    /// Remove the handler for `name`.
    pub fn unregister(&mut self, name: &str) -> Result<(), IpcError> {
        match self.entries.get(name) {
            None => Err(IpcError::CommandNotFound(name.to_string())),
            Some(entry) if entry.builtin => Err(IpcError::ReservedCommand(name.to_string())),
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
        }
    }

    /// Look up the entry for `name`.
    ///
    /// The entry is shared, so it can be invoked after the registry lock is
    /// released.
    pub fn lookup(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered command names, sorted, including `Ack`.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Install the observer called for every incoming `Ack`.
    pub fn set_ack_observer(&self, observer: AckObserver) {
        *self.ack_observer.write() = Some(observer);
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish_non_exhaustive()
    }
}

fn typed_handler<P, F>(command: &str, handler: F) -> ErasedHandler
where
    P: DeserializeOwned + 'static,
    F: Fn(&Identity, P) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let command = command.to_string();
    Box::new(move |sender: &Identity, payload: &serde_json::Value| {
        let payload = P::deserialize(payload)
            .map_err(|e| IpcError::serialization("command payload", e))?;
        handler(sender, payload).map_err(|e| IpcError::Handler {
            command: command.clone(),
            message: e.to_string(),
        })
    })
}

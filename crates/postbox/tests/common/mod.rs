//! Helpers shared by the integration tests.
//!
//! Every test uses identities with a random suffix so tests can run in
//! parallel against the same host namespace.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use postbox::{
    Ack, CommandEnvelope, Controller, ControllerConfig, ErrorSource, Identity, MessageId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub n: u32,
}

pub fn ping(n: u32) -> CommandEnvelope {
    CommandEnvelope::new("Ping", &Ping { n }).unwrap()
}

pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, MessageId::new().as_uuid().simple())
}

/// A controller plus everything its callbacks observed.
pub struct Participant {
    pub controller: Controller,
    pub errors: Arc<Mutex<Vec<(ErrorSource, String)>>>,
    pub pings: Arc<Mutex<Vec<(Identity, Ping)>>>,
    pub acks: Arc<Mutex<Vec<MessageId>>>,
}

impl Participant {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, ControllerConfig::default())
    }

    pub fn with_config(name: &str, config: ControllerConfig) -> Self {
        init_tracing();
        let errors: Arc<Mutex<Vec<(ErrorSource, String)>>> = Arc::default();
        let sink = Arc::clone(&errors);
        let controller = Controller::initialize(name, config, move |source, err| {
            sink.lock().push((source, err.to_string()));
        })
        .unwrap();

        let acks: Arc<Mutex<Vec<MessageId>>> = Arc::default();
        let sink = Arc::clone(&acks);
        controller.on_ack(move |_: &Identity, ack: Ack| {
            sink.lock().push(ack.acknowledged_message_id);
        });

        Self {
            controller,
            errors,
            pings: Arc::default(),
            acks,
        }
    }

    /// Register a `Ping` handler that records every call.
    pub fn handle_pings(&self) {
        let sink = Arc::clone(&self.pings);
        self.controller
            .register("Ping", move |sender: &Identity, ping: Ping| {
                sink.lock().push((sender.clone(), ping));
                Ok(())
            })
            .unwrap();
    }

    pub fn error_sources(&self) -> Vec<ErrorSource> {
        self.errors.lock().iter().map(|(s, _)| *s).collect()
    }
}

/// Config with a short reclaim timeout for tests that wait it out.
pub fn short_timeout(ms: u64) -> ControllerConfig {
    ControllerConfig::default().with_receive_data_timeout(Duration::from_millis(ms))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Holds a mailbox lock on a separate thread until dropped.
pub struct LockHolder {
    release: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl LockHolder {
    pub fn hold(identity: &Identity) -> Self {
        let identity = identity.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let mailbox = postbox::Mailbox::open(&identity).unwrap();
            let _guard = mailbox.lock(Duration::from_secs(5)).unwrap().unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();
        Self {
            release: Some(release_tx),
            thread: Some(thread),
        }
    }
}

impl Drop for LockHolder {
    fn drop(&mut self) {
        drop(self.release.take());
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

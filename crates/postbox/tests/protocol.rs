//! End-to-end tests of the mailbox protocol over real shared memory.
//!
//! Each "process" is a Controller in this test process; the protocol does
//! not care whether two controllers share an address space.

mod common;

use std::time::Duration;

use common::{LockHolder, Participant, Ping, ping, short_timeout, unique};
use postbox::mailbox::MAILBOX_MAGIC;
use postbox::postbox_shm::{NamedMutex, ShmRegion};
use postbox::{
    CommandEnvelope, Controller, ControllerConfig, ErrorSource, Identity, IpcError, Mailbox,
    MessageStore,
};

/// Overwrite a mailbox blob with `bytes` while holding its lock.
fn scribble_over_mailbox(identity: &Identity, bytes: &[u8]) {
    let mailbox = Mailbox::open(identity).unwrap();
    let _guard = mailbox.lock(Duration::from_millis(100)).unwrap().unwrap();
    let region = ShmRegion::open_existing(identity.mailbox_name()).unwrap();
    // SAFETY: the mailbox lock is held for the whole write.
    unsafe { region.write_blob(&MAILBOX_MAGIC, bytes) }.unwrap();
}

#[test]
fn round_trip_dispatches_once_with_sender() {
    let a = Participant::new(&unique("rt-a"));
    let b = Participant::new(&unique("rt-b"));
    b.handle_pings();

    assert!(a.controller.add_peer(b.controller.identity().as_str()));
    let id = a
        .controller
        .send(&ping(1), b.controller.identity().as_str())
        .unwrap();
    assert_eq!(a.controller.pending_stores(), vec![id]);

    let summary = b.controller.receive();
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.acks_sent, 1);

    let pings = b.pings.lock();
    assert_eq!(pings.len(), 1);
    assert_eq!(&pings[0].0, a.controller.identity());
    assert_eq!(pings[0].1, Ping { n: 1 });

    // The drained descriptor now sits in consumed.
    let state = b.controller.mailbox_snapshot().unwrap();
    assert!(state.outstanding.is_empty());
    assert_eq!(state.consumed_ids(), vec![id]);
    assert!(state.is_consistent());

    // The unknown sender was learned so the ack could be sent.
    assert!(b.controller.is_peer(a.controller.identity().as_str()));
    assert!(a.errors.lock().is_empty());
    assert!(b.errors.lock().is_empty());
}

#[test]
fn ack_reaches_sender_and_is_never_acknowledged() {
    let a = Participant::new(&unique("ack-a"));
    let b = Participant::new(&unique("ack-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();

    a.controller.add_peer(&b_name);
    let id = a.controller.send(&ping(1), &b_name).unwrap();
    b.controller.receive();

    let summary = a.controller.receive();
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.acks_sent, 0);
    assert_eq!(*a.acks.lock(), vec![id]);

    // Nothing came back to b for the Ack itself.
    let state = b.controller.mailbox_snapshot().unwrap();
    assert!(state.outstanding.is_empty());
    assert_eq!(b.controller.receive().drained, 0);
    assert_eq!(a.controller.receive().drained, 0);
    assert_eq!(a.acks.lock().len(), 1);
}

#[test]
fn next_send_reclaims_acknowledged_stores() {
    let a = Participant::new(&unique("reclaim-a"));
    let b = Participant::new(&unique("reclaim-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let first = a.controller.send(&ping(1), &b_name).unwrap();
    b.controller.receive();
    assert!(MessageStore::exists(first).unwrap());

    let second = a.controller.send(&ping(2), &b_name).unwrap();
    assert!(!MessageStore::exists(first).unwrap());
    assert_eq!(a.controller.pending_stores(), vec![second]);

    let state = b.controller.mailbox_snapshot().unwrap();
    assert!(state.consumed.is_empty());
    assert_eq!(state.outstanding_ids(), vec![second]);
}

#[test]
fn next_send_reclaims_timed_out_stores() {
    let a = Participant::with_config(&unique("timeout-a"), short_timeout(50));
    let b = Participant::new(&unique("timeout-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let stale = a.controller.send(&ping(1), &b_name).unwrap();
    std::thread::sleep(Duration::from_millis(120));

    let fresh = a.controller.send(&ping(2), &b_name).unwrap();
    let state = b.controller.mailbox_snapshot().unwrap();
    assert_eq!(state.outstanding_ids(), vec![fresh]);
    assert!(!MessageStore::exists(stale).unwrap());
    assert_eq!(a.controller.pending_stores(), vec![fresh]);
}

#[test]
fn timeout_reclaim_only_touches_own_descriptors() {
    let a = Participant::with_config(&unique("own-a"), short_timeout(50));
    let c = Participant::new(&unique("own-c"));
    let b = Participant::new(&unique("own-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);
    c.controller.add_peer(&b_name);

    let from_c = c.controller.send(&ping(1), &b_name).unwrap();
    std::thread::sleep(Duration::from_millis(120));
    let from_a = a.controller.send(&ping(2), &b_name).unwrap();

    let state = b.controller.mailbox_snapshot().unwrap();
    assert_eq!(state.outstanding.len(), 2);
    assert!(state.outstanding_ids().contains(&from_c));
    assert!(state.outstanding_ids().contains(&from_a));
    assert!(MessageStore::exists(from_c).unwrap());
}

#[test]
fn second_receive_is_a_no_op() {
    let a = Participant::new(&unique("idem-a"));
    let b = Participant::new(&unique("idem-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    a.controller.send(&ping(1), &b_name).unwrap();
    a.controller.send(&ping(2), &b_name).unwrap();
    assert_eq!(b.controller.receive().dispatched, 2);

    let again = b.controller.receive();
    assert_eq!(again.drained, 0);
    assert_eq!(again.dispatched, 0);
    assert_eq!(b.pings.lock().len(), 2);
}

#[test]
fn one_ack_per_drained_message() {
    let a = Participant::new(&unique("acks-a"));
    let b = Participant::new(&unique("acks-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let ids: Vec<_> = (0..3)
        .map(|n| a.controller.send(&ping(n), &b_name).unwrap())
        .collect();
    assert_eq!(b.controller.receive().acks_sent, 3);

    a.controller.receive();
    let mut acked = a.acks.lock().clone();
    acked.sort();
    let mut expected = ids;
    expected.sort();
    assert_eq!(acked, expected);
}

#[test]
fn unregistered_command_is_reported_and_consumed() {
    let a = Participant::new(&unique("unreg-a"));
    let b = Participant::new(&unique("unreg-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let id = a
        .controller
        .send(&CommandEnvelope::new("Pong", &Ping { n: 1 }).unwrap(), &b_name)
        .unwrap();

    let summary = b.controller.receive();
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.acks_sent, 1);

    let errors = b.errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorSource::Dispatch);
    assert!(errors[0].1.contains("Pong"));

    let state = b.controller.mailbox_snapshot().unwrap();
    assert_eq!(state.consumed_ids(), vec![id]);
}

#[test]
fn handler_error_does_not_stop_the_drain() {
    let a = Participant::new(&unique("herr-a"));
    let b = Participant::new(&unique("herr-b"));
    b.controller
        .register("Ping", |_: &postbox::Identity, ping: Ping| {
            if ping.n == 1 {
                Err("odd ping".into())
            } else {
                Ok(())
            }
        })
        .unwrap();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    for n in 0..3 {
        a.controller.send(&ping(n), &b_name).unwrap();
    }
    let summary = b.controller.receive();
    assert_eq!(summary.drained, 3);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(b.error_sources(), vec![ErrorSource::Dispatch]);
    assert!(b.errors.lock()[0].1.contains("odd ping"));
}

#[test]
fn reclaimed_store_is_skipped_and_consumed() {
    let a = Participant::new(&unique("gone-a"));
    let b = Participant::new(&unique("gone-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let id = a.controller.send(&ping(1), &b_name).unwrap();
    // The sender exits: its stores and its mailbox go away.
    drop(a);

    let summary = b.controller.receive();
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.acks_sent, 0);
    assert!(b.pings.lock().is_empty());

    // The store was missing, then the ack had nowhere to go.
    assert_eq!(
        b.error_sources(),
        vec![ErrorSource::Dispatch, ErrorSource::Ack]
    );
    let state = b.controller.mailbox_snapshot().unwrap();
    assert!(state.outstanding.is_empty());
    assert_eq!(state.consumed_ids(), vec![id]);
}

#[test]
fn duplicate_identity_is_rejected() {
    let name = unique("dup");
    let _first = Participant::new(&name);
    let second = Controller::initialize(&name, ControllerConfig::default(), |_, _| {});
    assert!(matches!(second, Err(IpcError::DuplicateIdentity(n)) if n == name));
}

#[test]
fn overflow_is_returned_and_leaves_no_store() {
    let a = Participant::new(&unique("ovf-a"));
    let b = Participant::with_config(
        &unique("ovf-b"),
        ControllerConfig::default().with_mailbox_capacity(300),
    );
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let mut sent = Vec::new();
    let overflow = loop {
        match a.controller.send(&ping(sent.len() as u32), &b_name) {
            Ok(id) => sent.push(id),
            Err(e) => break e,
        }
        assert!(sent.len() < 10, "mailbox never overflowed");
    };

    assert!(matches!(overflow, IpcError::MailboxOverflow { capacity: 300, .. }));
    assert!(!sent.is_empty());
    assert_eq!(a.error_sources(), vec![ErrorSource::Send]);
    assert_eq!(a.controller.pending_stores().len(), sent.len());

    let state = b.controller.mailbox_snapshot().unwrap();
    assert_eq!(state.outstanding.len(), sent.len());
}

#[test]
fn lock_timeout_leaves_store_until_it_ages_out() {
    let config = short_timeout(50).with_mutex_wait(Duration::from_millis(20));
    let a = Participant::with_config(&unique("busy-a"), config);
    let b = Participant::new(&unique("busy-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let holder = LockHolder::hold(b.controller.identity());
    let err = a.controller.send(&ping(1), &b_name).unwrap_err();
    assert!(matches!(err, IpcError::MailboxLockTimeout { .. }));
    let orphans = a.controller.pending_stores();
    assert_eq!(orphans.len(), 1);
    assert!(MessageStore::exists(orphans[0]).unwrap());
    drop(holder);

    std::thread::sleep(Duration::from_millis(120));
    let fresh = a.controller.send(&ping(2), &b_name).unwrap();
    assert_eq!(a.controller.pending_stores(), vec![fresh]);
    assert!(!MessageStore::exists(orphans[0]).unwrap());
}

#[test]
fn contended_receive_is_silent_by_default() {
    let quiet = Participant::new(&unique("contend-quiet"));
    let loud = Participant::with_config(
        &unique("contend-loud"),
        ControllerConfig::default()
            .with_mutex_wait(Duration::from_millis(20))
            .with_report_lock_timeouts(true),
    );

    {
        let _holder = LockHolder::hold(quiet.controller.identity());
        assert!(quiet.controller.receive().contended);
    }
    {
        let _holder = LockHolder::hold(loud.controller.identity());
        assert!(loud.controller.receive().contended);
    }

    assert!(quiet.errors.lock().is_empty());
    assert_eq!(loud.error_sources(), vec![ErrorSource::Receive]);
    assert!(!quiet.controller.receive().contended);
}

#[test]
fn peer_mailbox_is_inspectable() {
    let a = Participant::new(&unique("inspect-a"));
    let b = Participant::new(&unique("inspect-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);
    let id = a.controller.send(&ping(5), &b_name).unwrap();

    let mailbox = Mailbox::open(b.controller.identity()).unwrap();
    let guard = mailbox.lock(Duration::from_millis(100)).unwrap().unwrap();
    let state = guard.read_state().unwrap();
    assert_eq!(state.outstanding.len(), 1);
    let descriptor = &state.outstanding[0];
    assert_eq!(descriptor.id, id);
    assert_eq!(descriptor.command_name, "Ping");
    assert_eq!(&descriptor.sender_identity, a.controller.identity());

    let raw = String::from_utf8(guard.read_raw().unwrap()).unwrap();
    assert!(raw.contains("\"createdAtMonotonicMillis\""));
    assert!(raw.contains(&format!("\"senderIdentity\":\"{}\"", a.controller.identity())));
}

#[test]
fn stale_mailbox_can_be_removed() {
    let name = unique("stale");
    let crashed = Participant::new(&name);
    std::mem::forget(crashed);

    assert!(matches!(
        Controller::initialize(&name, ControllerConfig::default(), |_, _| {}),
        Err(IpcError::DuplicateIdentity(_))
    ));
    assert!(Controller::remove_stale(&name).unwrap());
    Controller::initialize(&name, ControllerConfig::default(), |_, _| {}).unwrap();
}

#[test]
fn overflow_still_hands_back_reclaimed_stores() {
    let a = Participant::new(&unique("ovf-reclaim-a"));
    let b = Participant::with_config(
        &unique("ovf-reclaim-b"),
        ControllerConfig::default().with_mailbox_capacity(400),
    );
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    let first = a.controller.send(&ping(1), &b_name).unwrap();
    b.controller.receive();
    assert_eq!(b.controller.mailbox_snapshot().unwrap().consumed_ids(), vec![first]);

    // The descriptor alone is larger than the mailbox.
    let oversized = CommandEnvelope::new("P".repeat(400), &Ping { n: 2 }).unwrap();
    let err = a.controller.send(&oversized, &b_name).unwrap_err();
    assert!(matches!(err, IpcError::MailboxOverflow { capacity: 400, .. }));
    assert_eq!(a.error_sources(), vec![ErrorSource::Send]);

    // The consumed entry was still pruned and its store released.
    let state = b.controller.mailbox_snapshot().unwrap();
    assert!(state.is_empty());
    assert!(!MessageStore::exists(first).unwrap());
    assert!(a.controller.pending_stores().is_empty());
}

#[test]
fn unreadable_local_mailbox_is_reported_and_reset() {
    let a = Participant::new(&unique("garbled-a"));
    let b = Participant::new(&unique("garbled-b"));
    b.handle_pings();
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    scribble_over_mailbox(b.controller.identity(), b"{not a mailbox");

    let summary = b.controller.receive();
    assert_eq!(summary.drained, 0);
    assert_eq!(b.error_sources(), vec![ErrorSource::Receive]);
    assert!(b.errors.lock()[0].1.contains("mailbox state"));
    assert!(b.controller.mailbox_snapshot().unwrap().is_empty());

    // The mailbox works again afterwards.
    a.controller.send(&ping(7), &b_name).unwrap();
    assert_eq!(b.controller.receive().dispatched, 1);
    assert_eq!(b.pings.lock()[0].1, Ping { n: 7 });
}

#[test]
fn unreadable_peer_mailbox_is_left_alone() {
    let a = Participant::new(&unique("garbled-peer-a"));
    let b = Participant::new(&unique("garbled-peer-b"));
    let b_name = b.controller.identity().to_string();
    a.controller.add_peer(&b_name);

    scribble_over_mailbox(b.controller.identity(), b"garbage");

    let err = a.controller.send(&ping(1), &b_name).unwrap_err();
    assert!(matches!(err, IpcError::Serialization { .. }));
    assert_eq!(a.error_sources(), vec![ErrorSource::Send]);
    assert!(a.controller.pending_stores().is_empty());

    let mailbox = Mailbox::open(b.controller.identity()).unwrap();
    let guard = mailbox.lock(Duration::from_millis(100)).unwrap().unwrap();
    assert_eq!(guard.read_raw().unwrap(), b"garbage");
}

#[test]
fn initialize_leaves_a_live_mutex_in_place() {
    let name = unique("racing");
    let identity = Identity::new(name.as_str()).unwrap();
    let other = NamedMutex::create(&identity.mutex_name()).unwrap();

    assert!(matches!(
        Controller::initialize(&name, ControllerConfig::default(), |_, _| {}),
        Err(IpcError::DuplicateIdentity(_))
    ));
    assert!(ShmRegion::exists(&identity.mutex_name()).unwrap());

    // Once the other side is gone the name is free, and stays reachable.
    drop(other);
    let participant = Participant::new(&name);
    assert!(Mailbox::open(participant.controller.identity()).is_ok());
}

#[test]
fn leftover_mutex_needs_remove_stale() {
    let name = unique("lone-mutex");
    let identity = Identity::new(name.as_str()).unwrap();
    std::mem::forget(NamedMutex::create(&identity.mutex_name()).unwrap());

    assert!(matches!(
        Controller::initialize(&name, ControllerConfig::default(), |_, _| {}),
        Err(IpcError::DuplicateIdentity(_))
    ));
    assert!(Controller::remove_stale(&name).unwrap());
    let participant = Participant::new(&name);
    assert!(Mailbox::open(participant.controller.identity()).is_ok());
}

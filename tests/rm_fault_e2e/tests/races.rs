// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::mpsc;
use std::time::Duration;

use nexus_rm::{Error, FaultHandler, FaultKind, FaultState, Outcome, SharedBacking, SignalTransmitter, Wait};
use nexus_rm_e2e::{wait_until, Harness, INITIAL_VALUE, MANAGED_ADDR};

#[test]
fn two_faults_in_one_page_need_one_attach() {
    let h = Harness::new();
    let page = h.shared_page();
    page.set(INITIAL_VALUE);
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();

    let child = h.child.thread().with_wait(Wait::NonBlocking);
    assert!(matches!(child.read_u32(MANAGED_ADDR + 0x10), Err(Error::WouldBlock)));
    assert!(matches!(child.read_u32(MANAGED_ADDR + 0x20), Err(Error::WouldBlock)));
    assert_eq!(h.child.region_map().state().unwrap().addr, MANAGED_ADDR + 0x20);

    match handler.handle_next(Wait::NonBlocking).unwrap() {
        Outcome::Resolved { fault, page: base, .. } => {
            assert_eq!(fault.addr, MANAGED_ADDR + 0x20);
            assert_eq!(base, MANAGED_ADDR);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Both faults coalesced into the one wakeup just handled.
    assert!(matches!(handler.wait(Wait::NonBlocking), Err(Error::WouldBlock)));

    assert_eq!(child.read_u32(MANAGED_ADDR + 0x10).unwrap(), 0);
    assert_eq!(child.read_u32(MANAGED_ADDR).unwrap(), INITIAL_VALUE);

    let err = handler.region_map().attach_at(page.ds, MANAGED_ADDR).unwrap_err();
    assert!(matches!(err, Error::RegionConflict { base: MANAGED_ADDR, .. }));
    assert!(!err.is_fatal());
}

#[test]
fn blocked_threads_in_one_page_all_resume() {
    let h = Harness::new();
    let page = h.shared_page();
    page.set(INITIAL_VALUE);
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();

    let (tx, rx) = mpsc::channel();
    for offset in [0x0, 0x100] {
        let tx = tx.clone();
        h.child
            .start(move |thread| {
                tx.send(thread.read_u32(MANAGED_ADDR + offset)?).ok();
                Ok(())
            })
            .unwrap();
    }
    h.wait_for_state(FaultState::is_fault);

    let mut values = Vec::new();
    wait_until(|| {
        match handler.handle_next(Wait::Timeout(Duration::from_millis(10))) {
            Ok(Outcome::Resolved { page: base, .. }) => assert_eq!(base, MANAGED_ADDR),
            Ok(Outcome::Spurious) | Err(Error::Timeout) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        values.extend(rx.try_iter());
        (values.len() == 2).then_some(())
    });
    values.sort_unstable();
    assert_eq!(values, vec![0, INITIAL_VALUE]);
    assert_eq!(handler.stats().resolved, 1);
    h.child.join();
}

#[test]
fn wakeup_after_foreign_resolution_is_spurious() {
    let h = Harness::new();
    let page = h.shared_page();
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();

    let child = h.child.thread().with_wait(Wait::NonBlocking);
    assert!(matches!(child.read_u32(MANAGED_ADDR), Err(Error::WouldBlock)));
    h.child.region_map().attach_at(page.ds, MANAGED_ADDR).unwrap();
    let before = h.child.region_map().bindings().unwrap();

    assert!(matches!(handler.handle_next(Wait::NonBlocking).unwrap(), Outcome::Spurious));
    assert_eq!(h.child.region_map().bindings().unwrap(), before);
}

#[test]
fn explicit_submit_without_fault_is_spurious() {
    let h = Harness::new();
    let page = h.shared_page();
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();
    let tx = SignalTransmitter::new(h.platform.clone(), handler.context().unwrap());
    assert!(tx.submit());
    assert!(tx.submit());

    assert!(matches!(handler.handle_next(Wait::NonBlocking).unwrap(), Outcome::Spurious));
    assert!(matches!(handler.handle_next(Wait::NonBlocking), Err(Error::WouldBlock)));
    let stats = handler.stats();
    assert_eq!((stats.wakeups, stats.spurious, stats.resolved), (1, 1, 0));
}

#[test]
fn write_to_read_only_image_is_already_resolved() {
    let h = Harness::new();
    let page = h.shared_page();
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();
    let image_base = h.platform.config().image_base;

    let child = h.child.thread().with_wait(Wait::NonBlocking);
    assert!(matches!(child.write_u32(image_base + 8, 1), Err(Error::WouldBlock)));
    match handler.handle_next(Wait::NonBlocking).unwrap() {
        Outcome::AlreadyResolved { fault, page: base } => {
            assert_eq!(fault, FaultState { kind: FaultKind::WriteFault, addr: image_base + 8 });
            assert_eq!(base, image_base);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(handler.stats().already_resolved, 1);
    assert!(h.child.region_map().state().unwrap().is_fault());
}

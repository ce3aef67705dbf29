// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::mpsc;

use nexus_rm::{FaultHandler, FaultKind, FaultState, Outcome, SharedBacking, Wait};
use nexus_rm_e2e::{Harness, INITIAL_VALUE, MANAGED_ADDR, TIMEOUT};

#[test]
fn read_fault_attach_read_detach_refault() {
    let h = Harness::new();
    let page = h.shared_page();
    page.set(INITIAL_VALUE);
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();

    let (tx, rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    h.child
        .start(move |thread| {
            tx.send(thread.read_u32(MANAGED_ADDR)?).ok();
            go_rx.recv().ok();
            tx.send(thread.read_u32(MANAGED_ADDR)?).ok();
            Ok(())
        })
        .unwrap();

    let (fault, base, dataspace) = match handler.handle_next(Wait::Timeout(TIMEOUT)).unwrap() {
        Outcome::Resolved { fault, page, dataspace } => (fault, page, dataspace),
        other => panic!("expected resolution, got {other:?}"),
    };
    assert_eq!(fault, FaultState { kind: FaultKind::ReadFault, addr: MANAGED_ADDR });
    assert_eq!(base, MANAGED_ADDR);
    assert_eq!(dataspace, page.ds);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), INITIAL_VALUE);

    // Revoke, then change the content; the child's second read must fault first.
    handler.revoke(MANAGED_ADDR).unwrap();
    go_tx.send(()).unwrap();
    let refault = h.wait_for_state(FaultState::is_fault);
    assert_eq!(refault, FaultState { kind: FaultKind::ReadFault, addr: MANAGED_ADDR });
    page.set(0x5678);
    assert!(matches!(handler.handle_next(Wait::Timeout(TIMEOUT)).unwrap(), Outcome::Resolved { .. }));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 0x5678);
    h.child.join();
}

#[test]
fn parent_child_modify_rounds() {
    let h = Harness::new();
    let page = h.shared_page();
    let mut handler =
        FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();

    h.child
        .start(|thread| {
            thread.read_u32(MANAGED_ADDR)?;
            loop {
                let value = thread.read_u32(MANAGED_ADDR)?.wrapping_add(1);
                thread.write_u32(MANAGED_ADDR, value)?;
            }
        })
        .unwrap();

    let mut rounds = 0;
    while rounds < 4 {
        page.set(INITIAL_VALUE);
        match handler.handle_next(Wait::Timeout(TIMEOUT)).unwrap() {
            Outcome::Resolved { fault, page: base, .. } => {
                assert_eq!(base, MANAGED_ADDR);
                assert!(matches!(fault.kind, FaultKind::ReadFault | FaultKind::WriteFault));
                assert_ne!(page.wait_for_change(INITIAL_VALUE), INITIAL_VALUE);
                handler.revoke(base).unwrap();
                rounds += 1;
            }
            Outcome::Spurious => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    let stats = handler.stats();
    assert_eq!(stats.resolved, 4);
    assert_eq!(stats.already_resolved, 0);
    assert!(h.child.region_map().bindings().unwrap().iter().all(|b| b.base != MANAGED_ADDR));
}

#[test]
fn child_stays_blocked_after_handler_is_gone() {
    let h = Harness::new();
    let page = h.shared_page();
    let handler = FaultHandler::new(h.platform.clone(), h.child.address_space(), SharedBacking::new(page.ds)).unwrap();
    drop(handler);

    let res = h.child.thread().with_wait(Wait::Timeout(std::time::Duration::from_millis(20))).read_u32(MANAGED_ADDR);
    assert!(matches!(res, Err(nexus_rm::Error::Timeout)));
    assert_eq!(h.child.region_map().state().unwrap().addr, MANAGED_ADDR);
}

#[test]
fn child_image_is_mapped_executable() {
    let h = Harness::new();
    let thread = h.child.thread().with_wait(Wait::NonBlocking);
    let image_base = h.platform.config().image_base;
    assert_eq!(thread.fetch(image_base).unwrap(), b'r');
    assert!(matches!(thread.fetch(MANAGED_ADDR), Err(nexus_rm::Error::WouldBlock)));
    assert_eq!(h.child.region_map().state().unwrap().kind, FaultKind::ExecFault);
}

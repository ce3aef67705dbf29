// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Random read/write/revoke interleavings against a demand-zero handler,
//! checked against a model of the resident pages and their contents.

use std::collections::HashMap;

use nexus_rm::{DemandZero, Error, FaultHandler, Outcome, Wait};
use nexus_rm_e2e::{Harness, MANAGED_ADDR};
use proptest::prelude::*;

const PAGES: usize = 6;

#[derive(Clone, Debug)]
enum Op {
    Read { page: usize, word: usize },
    Write { page: usize, word: usize, value: u32 },
    Revoke { page: usize, offset: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PAGES, 0usize..1024).prop_map(|(page, word)| Op::Read { page, word }),
        (0..PAGES, 0usize..1024, 1u32..).prop_map(|(page, word, value)| Op::Write { page, word, value }),
        (0..PAGES, 0usize..0x1000).prop_map(|(page, offset)| Op::Revoke { page, offset }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn resident_pages_match_model(ops in proptest::collection::vec(arb_op(), 1..48)) {
        let h = Harness::new();
        let page_size = h.platform.config().page_size;
        let mut handler =
            FaultHandler::new(h.platform.clone(), h.child.address_space(), DemandZero::new(h.ram.clone(), page_size))
                .unwrap();
        let child = h.child.thread().with_wait(Wait::NonBlocking);
        let used_before = h.ram.used();
        let mut model: HashMap<usize, HashMap<usize, u32>> = HashMap::new();

        for op in ops {
            match op {
                Op::Read { page, word } => {
                    let addr = MANAGED_ADDR + page * page_size + word * 4;
                    if !model.contains_key(&page) {
                        prop_assert!(matches!(child.read_u32(addr), Err(Error::WouldBlock)));
                        let outcome = handler.handle_next(Wait::NonBlocking).unwrap();
                        prop_assert!(matches!(outcome, Outcome::Resolved { .. }), "read fault: {:?}", outcome);
                        model.insert(page, HashMap::new());
                    }
                    let expected = model[&page].get(&word).copied().unwrap_or(0);
                    prop_assert_eq!(child.read_u32(addr).unwrap(), expected);
                }
                Op::Write { page, word, value } => {
                    let addr = MANAGED_ADDR + page * page_size + word * 4;
                    if !model.contains_key(&page) {
                        prop_assert!(matches!(child.write_u32(addr, value), Err(Error::WouldBlock)));
                        let outcome = handler.handle_next(Wait::NonBlocking).unwrap();
                        prop_assert!(matches!(outcome, Outcome::Resolved { .. }), "write fault: {:?}", outcome);
                    }
                    child.write_u32(addr, value).unwrap();
                    model.entry(page).or_default().insert(word, value);
                }
                Op::Revoke { page, offset } => {
                    handler.revoke(MANAGED_ADDR + page * page_size + offset).unwrap();
                    model.remove(&page);
                }
            }

            prop_assert_eq!(handler.backing().resident(), model.len());
            prop_assert_eq!(h.ram.used() - used_before, model.len() * page_size);
        }

        drop(handler);
        prop_assert_eq!(h.ram.used(), used_before);
    }
}

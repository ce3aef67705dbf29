// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for region-map bindings
//! OWNERS: @runtime
//! NOTE: Tests only; drives random attach/detach sequences against a simple range model.
//!
//! TEST_SCENARIOS:
//!   - bindings_never_overlap(): after every mutation live ranges are disjoint and match the model
//!   - repeated_cycles_do_not_leak(): attach/detach/fault loops on one page leave no residue

use std::sync::Arc;

use proptest::prelude::*;

use super::{Attach, FaultKind, RegionMapClient};
use crate::dataspace::{DataspaceAllocator, RamAccount};
use crate::{Error, Platform, RmConfig, Wait};

const BASE: usize = 0x4000_0000;
const PAGE: usize = 0x1000;

#[derive(Clone, Debug)]
enum Op {
    Attach { page: usize, pages: usize },
    Detach { page: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..48, 1usize..=4).prop_map(|(page, pages)| Op::Attach { page, pages }),
        (0usize..52).prop_map(|page| Op::Detach { page }),
    ]
}

fn setup() -> (Arc<Platform>, RegionMapClient, RamAccount) {
    let platform = Platform::new(RmConfig::default()).unwrap();
    let rm = RegionMapClient::new(platform.clone(), platform.create_region_map().unwrap());
    let ram = RamAccount::new(platform.clone(), 0x10_0000);
    (platform, rm, ram)
}

proptest! {
    #[test]
    fn bindings_never_overlap(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let (_platform, rm, ram) = setup();
        let ds = ram.alloc(4 * PAGE).unwrap();
        let mut model: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Attach { page, pages } => {
                    let base = BASE + page * PAGE;
                    let size = pages * PAGE;
                    let conflict = model.iter().any(|(b, s)| base < b + s && *b < base + size);
                    match rm.attach(Attach::new(ds).size(size).at(base)) {
                        Ok(addr) => {
                            prop_assert!(!conflict);
                            prop_assert_eq!(addr, base);
                            model.push((base, size));
                        }
                        Err(Error::RegionConflict { .. }) => prop_assert!(conflict),
                        Err(other) => prop_assert!(false, "unexpected attach error: {other}"),
                    }
                }
                Op::Detach { page } => {
                    let addr = BASE + page * PAGE;
                    let hit = model.iter().position(|(b, s)| addr >= *b && addr < b + s);
                    match (rm.detach(addr), hit) {
                        (Ok(()), Some(index)) => {
                            model.swap_remove(index);
                        }
                        (Err(Error::NoBinding(_)), None) => {}
                        (res, hit) => prop_assert!(false, "detach {addr:#x}: {res:?} model hit {hit:?}"),
                    }
                }
            }

            let live = rm.bindings().unwrap();
            for pair in live.windows(2) {
                prop_assert!(pair[0].base + pair[0].size <= pair[1].base);
            }
            let mut expected = model.clone();
            expected.sort_unstable();
            let actual: Vec<(usize, usize)> = live.iter().map(|b| (b.base, b.size)).collect();
            prop_assert_eq!(actual, expected);
        }
    }

    #[test]
    fn repeated_cycles_do_not_leak(rounds in 1usize..32) {
        let (platform, rm, ram) = setup();
        let ds = ram.alloc(PAGE).unwrap();
        let object = rm.object().unwrap();
        for _ in 0..rounds {
            let res = object.read(&platform, BASE, &mut [0u8; 4], Wait::NonBlocking);
            prop_assert!(matches!(res, Err(Error::WouldBlock)));
            prop_assert_eq!(rm.state().unwrap().kind, FaultKind::ReadFault);
            rm.attach_at(ds, BASE).unwrap();
            prop_assert!(!rm.state().unwrap().is_fault());
            object.read(&platform, BASE, &mut [0u8; 4], Wait::NonBlocking).unwrap();
            rm.detach(BASE).unwrap();
        }
        prop_assert!(rm.bindings().unwrap().is_empty());
        prop_assert_eq!(platform.live_dataspaces(), 1);
    }
}

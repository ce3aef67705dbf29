// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault handler resolving page faults of another domain's region map
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - FaultHandler::new(): manage a signal context and install it on the region map
//!   - FaultHandler::handle_next()/run(): wait, query `state()`, resolve
//!   - FaultHandler::revoke(): detach a page so the next access faults again
//!   - BackingStore: policy choosing the dataspace that backs a faulting page
//!
//! RESOLUTION LOOP:
//!   1. Block for a signal; a wakeup only means "go check"
//!   2. `state()` READY    -> Outcome::Spurious, nothing is attached or detached
//!   3. Round the fault address down to its page, pick backing, `attach_at`
//!   4. RegionConflict     -> Outcome::AlreadyResolved, backing is discarded
//!   5. Fatal errors (capability, range, alignment, destroyed) propagate;
//!      other failures become Outcome::Skipped so the loop keeps serving

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::dataspace::{DataspaceAllocator, DataspaceCap};
use crate::platform::Platform;
use crate::region_map::{FaultState, RegionMapCap, RegionMapClient};
use crate::signal::{Signal, SignalContext, SignalContextCap, SignalReceiver};
use crate::{CapKind, Error, Result, Wait, LOG_TARGET};

/// Result of one resolution attempt.
#[derive(Debug)]
pub enum Outcome {
    /// Woken but no fault was outstanding.
    Spurious,
    /// `dataspace` was attached at `page`.
    Resolved {
        /// Fault that was resolved.
        fault: FaultState,
        /// Page-aligned base of the new binding.
        page: usize,
        /// Dataspace now backing the page.
        dataspace: DataspaceCap,
    },
    /// A binding already covered `page`; nothing was attached.
    AlreadyResolved {
        /// Fault reported by `state()`.
        fault: FaultState,
        /// Page the handler tried to attach.
        page: usize,
    },
    /// Resolution failed with a recoverable error and was skipped.
    Skipped {
        /// Fault reported by `state()`.
        fault: FaultState,
        /// Why the fault could not be resolved.
        reason: Error,
    },
}

/// Chooses what backs a faulting page.
pub trait BackingStore {
    /// Dataspace to attach at `page` for `fault`.
    fn backing(&mut self, fault: &FaultState, page: usize) -> Result<DataspaceCap>;

    /// `ds` now backs `page`.
    fn attached(&mut self, _page: usize, _ds: DataspaceCap) {}

    /// `ds` was not attached because `page` was already bound or the attach failed.
    fn discard(&mut self, _page: usize, _ds: DataspaceCap) {}

    /// `page` was detached by [`FaultHandler::revoke`].
    fn release(&mut self, _page: usize) {}
}

/// Backs every fault with the same dataspace.
#[derive(Clone, Copy, Debug)]
pub struct SharedBacking {
    ds: DataspaceCap,
}

impl SharedBacking {
    /// Shares `ds` for every fault.
    pub fn new(ds: DataspaceCap) -> Self {
        Self { ds }
    }

    /// The shared dataspace.
    pub fn dataspace(&self) -> DataspaceCap {
        self.ds
    }
}

impl BackingStore for SharedBacking {
    fn backing(&mut self, _fault: &FaultState, _page: usize) -> Result<DataspaceCap> {
        Ok(self.ds)
    }
}

/// Allocates a fresh zero-filled page for every faulting page.
///
/// A page becomes resident once its attach succeeds. A fault on a resident
/// page hands out the resident dataspace, which is never freed by `discard`.
pub struct DemandZero<A: DataspaceAllocator> {
    allocator: A,
    page_size: usize,
    pages: HashMap<usize, DataspaceCap>,
}

impl<A: DataspaceAllocator> DemandZero<A> {
    /// Allocates `page_size` dataspaces from `allocator`.
    pub fn new(allocator: A, page_size: usize) -> Self {
        Self { allocator, page_size, pages: HashMap::new() }
    }

    /// Number of pages currently backed by this policy.
    pub fn resident(&self) -> usize {
        self.pages.len()
    }

    fn free(&self, page: usize, ds: DataspaceCap) {
        if let Err(err) = self.allocator.free(ds) {
            log::warn!(target: LOG_TARGET, "demand-zero: free of page {page:#x} failed: {err}");
        }
    }
}

impl<A: DataspaceAllocator> BackingStore for DemandZero<A> {
    fn backing(&mut self, _fault: &FaultState, page: usize) -> Result<DataspaceCap> {
        if let Some(ds) = self.pages.get(&page) {
            return Ok(*ds);
        }
        self.allocator.alloc(self.page_size)
    }

    fn attached(&mut self, page: usize, ds: DataspaceCap) {
        self.pages.insert(page, ds);
    }

    fn discard(&mut self, page: usize, ds: DataspaceCap) {
        if self.pages.get(&page) != Some(&ds) {
            self.free(page, ds);
        }
    }

    fn release(&mut self, page: usize) {
        if let Some(ds) = self.pages.remove(&page) {
            self.free(page, ds);
        }
    }
}

impl<A: DataspaceAllocator> Drop for DemandZero<A> {
    fn drop(&mut self) {
        for (page, ds) in std::mem::take(&mut self.pages) {
            self.free(page, ds);
        }
    }
}

/// Counters kept by a [`FaultHandler`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Signals received.
    pub wakeups: u64,
    /// Wakeups that found no outstanding fault.
    pub spurious: u64,
    /// Faults resolved by an attach.
    pub resolved: u64,
    /// Attaches that lost the race to an existing binding.
    pub already_resolved: u64,
    /// Faults skipped after a recoverable failure.
    pub skipped: u64,
}

/// Resolves the faults of one region map.
pub struct FaultHandler<B: BackingStore> {
    rm: RegionMapClient,
    receiver: SignalReceiver,
    context: SignalContext,
    page_size: usize,
    backing: B,
    stats: HandlerStats,
}

impl<B: BackingStore> FaultHandler<B> {
    /// Registers as fault handler of `address_space`.
    pub fn new(platform: Arc<Platform>, address_space: RegionMapCap, backing: B) -> Result<Self> {
        if !address_space.valid() {
            return Err(Error::InvalidCapability(CapKind::RegionMap));
        }
        let rm = RegionMapClient::new(platform.clone(), address_space);
        let receiver = SignalReceiver::new(platform.clone());
        let context = SignalContext::new();
        let cap = receiver.manage(&context)?;
        if let Err(err) = rm.fault_handler(cap) {
            let _ = receiver.dissolve(&context);
            return Err(err);
        }
        log::info!(target: LOG_TARGET, "handler: serving region map {address_space:?}");
        let page_size = platform.config().page_size;
        Ok(Self { rm, receiver, context, page_size, backing, stats: HandlerStats::default() })
    }

    /// Client of the served region map.
    pub fn region_map(&self) -> &RegionMapClient {
        &self.rm
    }

    /// The backing policy.
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Mutable access to the backing policy.
    pub fn backing_mut(&mut self) -> &mut B {
        &mut self.backing
    }

    /// Capability of the context the region map signals.
    pub fn context(&self) -> Option<SignalContextCap> {
        self.context.cap()
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    /// Blocks until the region map signals a fault.
    pub fn wait(&mut self, wait: Wait) -> Result<Signal> {
        let signal = self.receiver.wait_for_signal(wait)?;
        self.stats.wakeups += 1;
        log::debug!(target: LOG_TARGET, "handler: woken by {:?} (x{})", signal.context, signal.num);
        Ok(signal)
    }

    /// Queries the fault state and resolves whatever is outstanding.
    pub fn resolve_pending(&mut self) -> Result<Outcome> {
        let fault = self.rm.state()?;
        if !fault.is_fault() {
            self.stats.spurious += 1;
            log::debug!(target: LOG_TARGET, "handler: spurious wakeup");
            return Ok(Outcome::Spurious);
        }
        let page = fault.page(self.page_size);
        let ds = match self.backing.backing(&fault, page) {
            Ok(ds) => ds,
            Err(err) => return self.skip(fault, err),
        };
        match self.rm.attach_at(ds, page) {
            Ok(_) => {
                self.backing.attached(page, ds);
                self.stats.resolved += 1;
                log::info!(target: LOG_TARGET, "handler: {fault} -> attached {ds:?} at {page:#x}");
                Ok(Outcome::Resolved { fault, page, dataspace: ds })
            }
            Err(Error::RegionConflict { .. }) => {
                self.backing.discard(page, ds);
                self.stats.already_resolved += 1;
                log::warn!(target: LOG_TARGET, "handler: {fault} already resolved at {page:#x}");
                Ok(Outcome::AlreadyResolved { fault, page })
            }
            Err(err) => {
                self.backing.discard(page, ds);
                self.skip(fault, err)
            }
        }
    }

    fn skip(&mut self, fault: FaultState, err: Error) -> Result<Outcome> {
        if err.is_fatal() {
            log::error!(target: LOG_TARGET, "handler: resolving {fault} failed: {err}");
            return Err(err);
        }
        self.stats.skipped += 1;
        log::warn!(target: LOG_TARGET, "handler: skipping {fault}: {err}");
        Ok(Outcome::Skipped { fault, reason: err })
    }

    /// Waits for one signal and resolves the outstanding fault.
    pub fn handle_next(&mut self, wait: Wait) -> Result<Outcome> {
        self.wait(wait)?;
        self.resolve_pending()
    }

    /// Serves faults until `on_outcome` breaks or a fatal error occurs.
    pub fn run<F>(&mut self, mut on_outcome: F) -> Result<()>
    where
        F: FnMut(&mut Self, &Outcome) -> ControlFlow<()>,
    {
        loop {
            let outcome = self.handle_next(Wait::Blocking)?;
            if on_outcome(self, &outcome).is_break() {
                return Ok(());
            }
        }
    }

    /// Detaches the binding of the page containing `addr`; the next access faults again.
    ///
    /// Detaching an unbound page is a no-op.
    pub fn revoke(&mut self, addr: usize) -> Result<()> {
        let page = crate::page_floor(addr, self.page_size);
        match self.rm.detach(page) {
            Ok(()) => log::info!(target: LOG_TARGET, "handler: revoked {page:#x}"),
            Err(Error::NoBinding(_)) => log::debug!(target: LOG_TARGET, "handler: {page:#x} was not bound"),
            Err(err) => return Err(err),
        }
        self.backing.release(page);
        Ok(())
    }
}

impl<B: BackingStore> Drop for FaultHandler<B> {
    fn drop(&mut self) {
        if let Err(err) = self.receiver.dissolve(&self.context) {
            log::warn!(target: LOG_TARGET, "handler: dissolve failed: {err}");
        }
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region maps: address-range -> dataspace bindings plus the fault slot
//! OWNERS: @runtime
//! PUBLIC API: RegionMapClient{attach,attach_at,detach,fault_handler,state,bindings}, Attach,
//!             FaultState, FaultKind, Access, Rights
//! DEPENDS_ON: platform (capability resolution, signal submission), dataspace
//! INVARIANTS:
//!   - Bindings are page aligned and never overlap
//!   - One outstanding-fault slot; a newer fault overwrites an older one
//!   - `state()` never clears the slot; only an attach covering the faulting address does
//!   - Faulting accesses block until bindings change, then retry from scratch

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cap::Cap;
use crate::dataspace::{Dataspace, DataspaceCap};
use crate::platform::Platform;
use crate::signal::SignalContextCap;
use crate::{page_ceil, CapKind, Error, Result, RmConfig, Wait, LOG_TARGET};

#[cfg(test)]
mod tests_prop;

/// Capability designating a [`RegionMap`].
pub type RegionMapCap = Cap<RegionMap>;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Access rights granted by a binding.
    pub struct Rights: u8 {
        /// Loads are permitted.
        const READ = 1 << 0;
        /// Stores are permitted.
        const WRITE = 1 << 1;
        /// Instruction fetches are permitted.
        const EXEC = 1 << 2;
    }
}

/// Kind of memory access performed by a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Exec,
}

impl Access {
    fn required(self) -> Rights {
        match self {
            Self::Read => Rights::READ,
            Self::Write => Rights::WRITE,
            Self::Exec => Rights::EXEC,
        }
    }

    fn fault_kind(self) -> FaultKind {
        match self {
            Self::Read => FaultKind::ReadFault,
            Self::Write => FaultKind::WriteFault,
            Self::Exec => FaultKind::ExecFault,
        }
    }
}

/// Classification of the outstanding fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// No fault outstanding.
    Ready,
    /// Load from an unbacked address.
    ReadFault,
    /// Store to an unbacked or read-only address.
    WriteFault,
    /// Instruction fetch from an unbacked or non-executable address.
    ExecFault,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "READY",
            Self::ReadFault => "READ_FAULT",
            Self::WriteFault => "WRITE_FAULT",
            Self::ExecFault => "EXEC_FAULT",
        })
    }
}

/// Snapshot returned by [`RegionMapClient::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultState {
    /// What kind of fault is outstanding.
    pub kind: FaultKind,
    /// Faulting address; meaningless when `kind` is [`FaultKind::Ready`].
    pub addr: usize,
}

impl FaultState {
    /// The "no fault" snapshot.
    pub const READY: Self = Self { kind: FaultKind::Ready, addr: 0 };

    /// Returns `true` when a fault is outstanding.
    pub fn is_fault(&self) -> bool {
        self.kind != FaultKind::Ready
    }

    /// Faulting address rounded down to its page.
    pub fn page(&self, page_size: usize) -> usize {
        crate::page_floor(self.addr, page_size)
    }
}

impl fmt::Display for FaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pf_addr={:#x}", self.kind, self.addr)
    }
}

/// Attach request; the defaults bind the whole dataspace writeable at a chosen address.
#[derive(Clone, Copy, Debug)]
pub struct Attach {
    ds: DataspaceCap,
    size: usize,
    offset: usize,
    local_addr: Option<usize>,
    executable: bool,
    writeable: bool,
}

impl Attach {
    /// Starts a request for `ds`.
    pub fn new(ds: DataspaceCap) -> Self {
        Self { ds, size: 0, offset: 0, local_addr: None, executable: false, writeable: true }
    }

    /// Number of bytes to bind; `0` binds everything from `offset` to the end.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Page-aligned offset into the dataspace.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Pins the base address instead of letting the region map choose one.
    pub fn at(mut self, local_addr: usize) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    /// Permits instruction fetches.
    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    /// Permits stores; ignored for read-only dataspaces.
    pub fn writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }
}

/// Public view of one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    /// First address of the range.
    pub base: usize,
    /// Length of the range.
    pub size: usize,
    /// Bound dataspace.
    pub dataspace: DataspaceCap,
    /// Offset of `base` within the dataspace.
    pub offset: usize,
    /// Effective rights.
    pub rights: Rights,
}

struct Binding {
    size: usize,
    ds_cap: DataspaceCap,
    ds: Arc<Dataspace>,
    offset: usize,
    rights: Rights,
}

#[derive(Default)]
struct Inner {
    bindings: BTreeMap<usize, Binding>,
    fault: Option<FaultState>,
    handler: Option<SignalContextCap>,
    epoch: u64,
    destroyed: bool,
}

impl Inner {
    fn covering(&self, addr: usize) -> Option<(usize, &Binding)> {
        self.bindings
            .range(..=addr)
            .next_back()
            .filter(|(base, binding)| addr - **base < binding.size)
            .map(|(base, binding)| (*base, binding))
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        self.bindings
            .range(..base + size)
            .next_back()
            .is_some_and(|(other, binding)| other + binding.size > base)
    }

    fn first_fit(&self, size: usize, start: usize, end: usize) -> Option<usize> {
        let mut cursor = start;
        for (base, binding) in &self.bindings {
            if cursor.checked_add(size)? <= *base {
                return Some(cursor);
            }
            cursor = cursor.max(base + binding.size);
        }
        (cursor.checked_add(size)? <= end).then_some(cursor)
    }
}

/// Address-space abstraction of one protection domain.
pub struct RegionMap {
    page_size: usize,
    va_base: usize,
    va_end: usize,
    inner: Mutex<Inner>,
    retry: Condvar,
}

impl RegionMap {
    pub(crate) fn new(config: &RmConfig) -> Self {
        Self {
            page_size: config.page_size,
            va_base: config.va_base,
            va_end: config.va_base + config.va_size,
            inner: Mutex::new(Inner::default()),
            retry: Condvar::new(),
        }
    }

    fn attach(&self, ds: Arc<Dataspace>, req: &Attach) -> Result<usize> {
        let mask = self.page_size - 1;
        if req.offset & mask != 0 {
            return Err(Error::Unaligned(req.offset));
        }
        let limit = ds.size();
        if req.offset >= limit || req.size > limit - req.offset {
            return Err(Error::OutOfRange { offset: req.offset, size: req.size, limit });
        }
        let requested = if req.size == 0 { limit - req.offset } else { req.size };
        let size = page_ceil(requested, self.page_size)
            .filter(|size| *size <= limit - req.offset)
            .ok_or(Error::OutOfRange { offset: req.offset, size: requested, limit })?;

        let mut rights = Rights::READ;
        rights.set(Rights::WRITE, req.writeable && ds.writeable());
        rights.set(Rights::EXEC, req.executable);

        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::Destroyed);
        }
        let base = match req.local_addr {
            Some(addr) => {
                if addr & mask != 0 {
                    return Err(Error::Unaligned(addr));
                }
                let in_window = addr >= self.va_base && addr.checked_add(size).is_some_and(|end| end <= self.va_end);
                if !in_window {
                    return Err(Error::OutOfAddressSpace { size });
                }
                if inner.overlaps(addr, size) {
                    return Err(Error::RegionConflict { base: addr, size });
                }
                addr
            }
            None => inner.first_fit(size, self.va_base, self.va_end).ok_or(Error::OutOfAddressSpace { size })?,
        };

        inner.bindings.insert(base, Binding { size, ds_cap: req.ds, ds, offset: req.offset, rights });
        if inner.fault.is_some_and(|fault| fault.addr >= base && fault.addr - base < size) {
            inner.fault = None;
        }
        inner.epoch += 1;
        drop(inner);
        self.retry.notify_all();
        log::debug!(target: LOG_TARGET, "rm: attach {:?} at {base:#x}+{size:#x} {rights:?}", req.ds);
        Ok(base)
    }

    fn detach(&self, addr: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let base = inner.covering(addr).map(|(base, _)| base).ok_or(Error::NoBinding(addr))?;
        inner.bindings.remove(&base);
        log::debug!(target: LOG_TARGET, "rm: detach {base:#x}");
        Ok(())
    }

    fn state(&self) -> FaultState {
        self.inner.lock().fault.unwrap_or(FaultState::READY)
    }

    fn bindings(&self) -> Vec<BindingInfo> {
        self.inner
            .lock()
            .bindings
            .iter()
            .map(|(base, binding)| BindingInfo {
                base: *base,
                size: binding.size,
                dataspace: binding.ds_cap,
                offset: binding.offset,
                rights: binding.rights,
            })
            .collect()
    }

    /// Drops every binding of a dataspace that was freed.
    pub(crate) fn purge(&self, ds: DataspaceCap) {
        self.inner.lock().bindings.retain(|_, binding| binding.ds_cap != ds);
    }

    /// Terminal transition: revokes all bindings and fails blocked accesses.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        inner.bindings.clear();
        inner.fault = None;
        inner.handler = None;
        inner.epoch += 1;
        drop(inner);
        self.retry.notify_all();
    }

    /// Translates `addr` for `access`, raising a fault and blocking while it is unbacked.
    ///
    /// Returns the dataspace, the offset in it, and how many of `len` bytes it backs.
    fn translate(
        &self,
        platform: &Platform,
        addr: usize,
        access: Access,
        len: usize,
        wait: Wait,
    ) -> Result<(Arc<Dataspace>, usize, usize)> {
        let deadline = wait.timeout().map(|timeout| Instant::now() + timeout);
        let mut inner = self.inner.lock();
        loop {
            if inner.destroyed {
                return Err(Error::Destroyed);
            }
            if let Some((base, binding)) = inner.covering(addr) {
                if binding.rights.contains(access.required()) {
                    let delta = addr - base;
                    return Ok((binding.ds.clone(), binding.offset + delta, len.min(binding.size - delta)));
                }
            }

            let fault = FaultState { kind: access.fault_kind(), addr };
            let notify = if inner.fault == Some(fault) {
                None
            } else {
                inner.fault = Some(fault);
                log::debug!(target: LOG_TARGET, "rm: {fault}");
                inner.handler
            };
            let epoch = inner.epoch;
            if let Some(cap) = notify {
                MutexGuard::unlocked(&mut inner, || {
                    platform.submit(cap);
                });
            }
            if inner.epoch != epoch {
                continue;
            }
            match (wait, deadline) {
                (Wait::NonBlocking, _) => return Err(Error::WouldBlock),
                (_, Some(deadline)) => {
                    if self.retry.wait_until(&mut inner, deadline).timed_out() && inner.epoch == epoch {
                        return Err(Error::Timeout);
                    }
                }
                (_, None) => self.retry.wait(&mut inner),
            }
        }
    }

    pub(crate) fn read(&self, platform: &Platform, addr: usize, buf: &mut [u8], wait: Wait) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr.checked_add(done).ok_or(Error::OutOfAddressSpace { size: buf.len() })?;
            let (ds, offset, len) = self.translate(platform, at, Access::Read, buf.len() - done, wait)?;
            ds.read(offset, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    pub(crate) fn write(&self, platform: &Platform, addr: usize, bytes: &[u8], wait: Wait) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let at = addr.checked_add(done).ok_or(Error::OutOfAddressSpace { size: bytes.len() })?;
            let (ds, offset, len) = self.translate(platform, at, Access::Write, bytes.len() - done, wait)?;
            ds.write(offset, &bytes[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    pub(crate) fn fetch(&self, platform: &Platform, addr: usize, wait: Wait) -> Result<u8> {
        let (ds, offset, _) = self.translate(platform, addr, Access::Exec, 1, wait)?;
        let mut byte = [0u8; 1];
        ds.read(offset, &mut byte)?;
        Ok(byte[0])
    }
}

/// Capability-invoked interface to a region map.
#[derive(Clone)]
pub struct RegionMapClient {
    platform: Arc<Platform>,
    cap: RegionMapCap,
}

impl RegionMapClient {
    /// Wraps `cap`; validity is checked on every invocation.
    pub fn new(platform: Arc<Platform>, cap: RegionMapCap) -> Self {
        Self { platform, cap }
    }

    /// Capability this client invokes.
    pub fn cap(&self) -> RegionMapCap {
        self.cap
    }

    pub(crate) fn object(&self) -> Result<Arc<RegionMap>> {
        if !self.cap.valid() {
            return Err(Error::InvalidCapability(CapKind::RegionMap));
        }
        self.platform.region_map(self.cap)
    }

    /// Creates a binding and returns its base address.
    pub fn attach(&self, req: Attach) -> Result<usize> {
        let rm = self.object()?;
        if !req.ds.valid() {
            return Err(Error::InvalidCapability(CapKind::Dataspace));
        }
        let ds = self.platform.dataspace(req.ds)?;
        rm.attach(ds, &req)
    }

    /// Binds all of `ds` at exactly `addr`.
    pub fn attach_at(&self, ds: DataspaceCap, addr: usize) -> Result<usize> {
        self.attach(Attach::new(ds).at(addr))
    }

    /// Removes the binding covering `addr`; [`Error::NoBinding`] if there is none.
    pub fn detach(&self, addr: usize) -> Result<()> {
        self.object()?.detach(addr)
    }

    /// Installs the context notified on future faults, replacing any previous one.
    pub fn fault_handler(&self, context: SignalContextCap) -> Result<()> {
        if !context.valid() {
            return Err(Error::InvalidCapability(CapKind::SignalContext));
        }
        let rm = self.object()?;
        rm.inner.lock().handler = Some(context);
        log::debug!(target: LOG_TARGET, "rm: fault handler {context:?}");
        Ok(())
    }

    /// Current fault snapshot; idempotent.
    pub fn state(&self) -> Result<FaultState> {
        Ok(self.object()?.state())
    }

    /// Snapshot of all bindings ordered by base address.
    pub fn bindings(&self) -> Result<Vec<BindingInfo>> {
        Ok(self.object()?.bindings())
    }
}

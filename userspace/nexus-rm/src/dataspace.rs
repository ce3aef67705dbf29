// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Dataspaces (fixed-size backing memory) and the RAM allocator seam
//! OWNERS: @runtime
//! PUBLIC API: Dataspace, DataspaceCap, DataspaceAllocator, RamAccount
//! INVARIANTS: Dataspace size is fixed at creation and page granular;
//!             a RAM account never hands out more than its quota;
//!             only the allocating account may free a dataspace

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cap::Cap;
use crate::platform::Platform;
use crate::{page_ceil, CapKind, Error, Result, LOG_TARGET};

/// Capability designating a [`Dataspace`].
pub type DataspaceCap = Cap<Dataspace>;

/// Fixed-size block of backing memory shared by every binding that attaches it.
pub struct Dataspace {
    writeable: bool,
    data: RwLock<Vec<u8>>,
}

impl Dataspace {
    pub(crate) fn zeroed(size: usize) -> Self {
        Self { writeable: true, data: RwLock::new(vec![0; size]) }
    }

    pub(crate) fn read_only(mut content: Vec<u8>, size: usize) -> Self {
        content.resize(size, 0);
        Self { writeable: false, data: RwLock::new(content) }
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    /// Whether bindings of this dataspace may be writeable.
    pub fn writeable(&self) -> bool {
        self.writeable
    }

    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let src = offset
            .checked_add(buf.len())
            .and_then(|end| data.get(offset..end))
            .ok_or(Error::OutOfRange { offset, size: buf.len(), limit: data.len() })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let limit = data.len();
        let dst = offset
            .checked_add(bytes.len())
            .and_then(|end| data.get_mut(offset..end))
            .ok_or(Error::OutOfRange { offset, size: bytes.len(), limit })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

/// Supplier of backing memory; opaque to the fault-resolution core.
pub trait DataspaceAllocator {
    /// Allocates a zero-filled dataspace of at least `size` bytes.
    fn alloc(&self, size: usize) -> Result<DataspaceCap>;

    /// Releases a dataspace previously returned by [`alloc`](Self::alloc).
    fn free(&self, ds: DataspaceCap) -> Result<()>;
}

impl<A: DataspaceAllocator + ?Sized> DataspaceAllocator for Arc<A> {
    fn alloc(&self, size: usize) -> Result<DataspaceCap> {
        (**self).alloc(size)
    }

    fn free(&self, ds: DataspaceCap) -> Result<()> {
        (**self).free(ds)
    }
}

struct Quota {
    limit: usize,
    used: usize,
    allocations: HashMap<DataspaceCap, usize>,
}

/// Quota-tracked RAM allocator.
pub struct RamAccount {
    platform: Arc<Platform>,
    quota: Mutex<Quota>,
}

impl RamAccount {
    /// Creates an account able to allocate up to `quota` bytes.
    pub fn new(platform: Arc<Platform>, quota: usize) -> Self {
        Self { platform, quota: Mutex::new(Quota { limit: quota, used: 0, allocations: HashMap::new() }) }
    }

    /// Total quota of the account.
    pub fn quota(&self) -> usize {
        self.quota.lock().limit
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.quota.lock().used
    }

    /// Bytes still available for allocation.
    pub fn avail(&self) -> usize {
        let quota = self.quota.lock();
        quota.limit - quota.used
    }

    /// Moves `amount` bytes of unused quota to `to`.
    pub fn transfer_quota(&self, to: &RamAccount, amount: usize) -> Result<()> {
        {
            let mut quota = self.quota.lock();
            let available = quota.limit - quota.used;
            if amount > available {
                return Err(Error::QuotaExceeded { requested: amount, available });
            }
            quota.limit -= amount;
        }
        to.quota.lock().limit += amount;
        log::debug!(target: LOG_TARGET, "ram: transferred {amount:#x} bytes of quota");
        Ok(())
    }
}

impl DataspaceAllocator for RamAccount {
    fn alloc(&self, size: usize) -> Result<DataspaceCap> {
        let page_size = self.platform.config().page_size;
        let size = page_ceil(size.max(1), page_size).ok_or(Error::OutOfRange {
            offset: 0,
            size,
            limit: usize::MAX,
        })?;
        let mut quota = self.quota.lock();
        let available = quota.limit - quota.used;
        if size > available {
            return Err(Error::QuotaExceeded { requested: size, available });
        }
        let cap = self.platform.create_dataspace(Dataspace::zeroed(size))?;
        quota.used += size;
        quota.allocations.insert(cap, size);
        log::debug!(target: LOG_TARGET, "ram: alloc {size:#x} bytes -> {cap:?}");
        Ok(cap)
    }

    fn free(&self, ds: DataspaceCap) -> Result<()> {
        if !ds.valid() {
            return Err(Error::InvalidCapability(CapKind::Dataspace));
        }
        let mut quota = self.quota.lock();
        let size = quota.allocations.remove(&ds).ok_or(Error::InvalidCapability(CapKind::Dataspace))?;
        quota.used -= size;
        drop(quota);
        self.platform.destroy_dataspace(ds)?;
        log::debug!(target: LOG_TARGET, "ram: free {ds:?}");
        Ok(())
    }
}

impl Drop for RamAccount {
    fn drop(&mut self) {
        let allocations: Vec<DataspaceCap> = self.quota.get_mut().allocations.drain().map(|(cap, _)| cap).collect();
        for cap in allocations {
            let _ = self.platform.destroy_dataspace(cap);
        }
    }
}

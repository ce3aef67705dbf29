// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host emulation of the capability-enforcing layer
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Platform::new(): create the layer from a validated RmConfig
//!   - Platform::rom(): publish read-only content as a dataspace
//!   - Platform::create_region_map()/destroy_region_map(): address-space lifecycle
//!   - Platform::dataspace(): resolve a dataspace capability
//!
//! SECURITY INVARIANTS:
//!   - Objects are reachable only through capabilities issued here
//!   - Revoked capabilities stay stale even after their slot is reused
//!   - Capability spaces are bounded by `RmConfig::cap_slots`
//!
//! LOCK ORDER: a capability-space lock is never held while calling into an object.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cap::CapSpace;
use crate::dataspace::{Dataspace, DataspaceCap};
use crate::region_map::{RegionMap, RegionMapCap};
use crate::signal::{SignalContextCap, SignalSlot};
use crate::{page_ceil, CapKind, Error, Result, RmConfig, LOG_TARGET};

/// Owner of every capability space.
pub struct Platform {
    config: RmConfig,
    dataspaces: Mutex<CapSpace<Dataspace>>,
    region_maps: Mutex<CapSpace<RegionMap>>,
    signals: Mutex<CapSpace<SignalSlot>>,
}

impl Platform {
    /// Creates a platform after validating `config`.
    pub fn new(config: RmConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let slots = config.cap_slots;
        Ok(Arc::new(Self {
            config,
            dataspaces: Mutex::new(CapSpace::with_limit(slots)),
            region_maps: Mutex::new(CapSpace::with_limit(slots)),
            signals: Mutex::new(CapSpace::with_limit(slots)),
        }))
    }

    /// Returns the configuration the platform was created with.
    pub fn config(&self) -> &RmConfig {
        &self.config
    }

    /// Publishes `content` as a read-only dataspace rounded up to whole pages.
    pub fn rom(&self, content: &[u8]) -> Result<DataspaceCap> {
        let size = page_ceil(content.len().max(1), self.config.page_size)
            .ok_or(Error::OutOfAddressSpace { size: content.len() })?;
        self.create_dataspace(Dataspace::read_only(content.to_vec(), size))
    }

    /// Resolves a dataspace capability.
    pub fn dataspace(&self, cap: DataspaceCap) -> Result<Arc<Dataspace>> {
        self.dataspaces.lock().lookup(cap).ok_or(Error::InvalidCapability(CapKind::Dataspace))
    }

    /// Number of live dataspaces.
    pub fn live_dataspaces(&self) -> usize {
        self.dataspaces.lock().len()
    }

    /// Creates an empty region map.
    pub fn create_region_map(&self) -> Result<RegionMapCap> {
        let rm = Arc::new(RegionMap::new(&self.config));
        let cap = self.region_maps.lock().insert(rm).ok_or(Error::CapSpaceFull(CapKind::RegionMap))?;
        log::debug!(target: LOG_TARGET, "platform: created region map {cap:?}");
        Ok(cap)
    }

    /// Destroys a region map, revoking all of its bindings.
    pub fn destroy_region_map(&self, cap: RegionMapCap) -> Result<()> {
        let rm = self.region_maps.lock().remove(cap).ok_or(Error::InvalidCapability(CapKind::RegionMap))?;
        rm.destroy();
        log::debug!(target: LOG_TARGET, "platform: destroyed region map {cap:?}");
        Ok(())
    }

    /// Number of live region maps.
    pub fn live_region_maps(&self) -> usize {
        self.region_maps.lock().len()
    }

    pub(crate) fn region_map(&self, cap: RegionMapCap) -> Result<Arc<RegionMap>> {
        self.region_maps.lock().lookup(cap).ok_or(Error::InvalidCapability(CapKind::RegionMap))
    }

    pub(crate) fn create_dataspace(&self, ds: Dataspace) -> Result<DataspaceCap> {
        self.dataspaces.lock().insert(Arc::new(ds)).ok_or(Error::CapSpaceFull(CapKind::Dataspace))
    }

    /// Revokes `cap` and detaches it from every region map.
    pub(crate) fn destroy_dataspace(&self, cap: DataspaceCap) -> Result<()> {
        self.dataspaces.lock().remove(cap).ok_or(Error::InvalidCapability(CapKind::Dataspace))?;
        let maps: Vec<Arc<RegionMap>> = self.region_maps.lock().iter().map(|(_, rm)| rm.clone()).collect();
        for rm in maps {
            rm.purge(cap);
        }
        Ok(())
    }

    pub(crate) fn create_signal(&self, slot: SignalSlot) -> Result<SignalContextCap> {
        self.signals.lock().insert(Arc::new(slot)).ok_or(Error::CapSpaceFull(CapKind::SignalContext))
    }

    pub(crate) fn revoke_signal(&self, cap: SignalContextCap) -> Option<Arc<SignalSlot>> {
        self.signals.lock().remove(cap)
    }

    /// Delivers one notification to `cap`; `false` when the context is gone.
    pub(crate) fn submit(&self, cap: SignalContextCap) -> bool {
        let slot = self.signals.lock().lookup(cap);
        slot.is_some_and(|slot| slot.submit(cap))
    }
}

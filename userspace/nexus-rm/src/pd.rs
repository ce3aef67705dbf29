// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Protection domains and the threads executing inside their address space
//! OWNERS: @runtime
//! PUBLIC API: DomainConfig, ProtectionDomain{create,address_space,region_map,thread,start,join},
//!             DomainThread{read,write,read_u32,write_u32,fetch}
//! DEPENDS_ON: platform, region_map
//! INVARIANTS:
//!   - A domain owns exactly one region map for its whole lifetime
//!   - Every memory access of a domain thread is translated by that region map
//!   - Dropping the domain destroys the region map before joining its threads,
//!     so threads blocked on a fault observe `Error::Destroyed`

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::dataspace::DataspaceCap;
use crate::platform::Platform;
use crate::region_map::{Attach, RegionMap, RegionMapCap, RegionMapClient};
use crate::{CapKind, Error, Result, Wait, LOG_TARGET};

/// Describes the initial contents of a domain's address space.
#[derive(Clone, Debug)]
pub struct DomainConfig {
    name: String,
    image: Option<DataspaceCap>,
    dynamic_linker: Option<DataspaceCap>,
}

impl DomainConfig {
    /// Starts a description of a domain called `name` with an empty address space.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), image: None, dynamic_linker: None }
    }

    /// Program image attached read-only and executable at `RmConfig::image_base`.
    pub fn image(mut self, ds: DataspaceCap) -> Self {
        self.image = Some(ds);
        self
    }

    /// Dynamic linker attached read-only and executable at `RmConfig::linker_base`.
    pub fn dynamic_linker(mut self, ds: DataspaceCap) -> Self {
        self.dynamic_linker = Some(ds);
        self
    }
}

/// Isolated execution context with its own region map.
pub struct ProtectionDomain {
    platform: Arc<Platform>,
    name: String,
    address_space: RegionMapCap,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtectionDomain {
    /// Creates the domain's region map and attaches the configured images.
    ///
    /// On failure the half-built region map is destroyed again.
    pub fn create(platform: Arc<Platform>, config: DomainConfig) -> Result<Self> {
        let address_space = platform.create_region_map()?;
        let rm = RegionMapClient::new(platform.clone(), address_space);
        let initial = [
            (config.image, platform.config().image_base),
            (config.dynamic_linker, platform.config().linker_base),
        ];
        for (ds, base) in initial {
            let Some(ds) = ds else { continue };
            if let Err(err) = rm.attach(Attach::new(ds).at(base).writeable(false).executable(true)) {
                log::warn!(target: LOG_TARGET, "pd {}: initial attach at {base:#x} failed: {err}", config.name);
                let _ = platform.destroy_region_map(address_space);
                return Err(err);
            }
        }
        log::info!(target: LOG_TARGET, "pd {}: created with region map {address_space:?}", config.name);
        Ok(Self { platform, name: config.name, address_space, threads: Mutex::new(Vec::new()) })
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability of the domain's region map, handed to whoever resolves its faults.
    pub fn address_space(&self) -> RegionMapCap {
        self.address_space
    }

    /// Client for the domain's region map.
    pub fn region_map(&self) -> RegionMapClient {
        RegionMapClient::new(self.platform.clone(), self.address_space)
    }

    /// Handle for accessing memory as this domain, blocking on faults.
    pub fn thread(&self) -> DomainThread {
        DomainThread { platform: self.platform.clone(), address_space: self.address_space, wait: Wait::Blocking }
    }

    /// Runs `entry` on a new thread executing inside the domain.
    pub fn start<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce(DomainThread) -> Result<()> + Send + 'static,
    {
        let context = self.thread();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("pd-{name}"))
            .spawn(move || match entry(context) {
                Ok(()) => log::info!(target: LOG_TARGET, "pd {name}: thread exited"),
                Err(Error::Destroyed) => log::info!(target: LOG_TARGET, "pd {name}: address space destroyed"),
                Err(err) => log::warn!(target: LOG_TARGET, "pd {name}: thread failed: {err}"),
            })
            .map_err(Error::Spawn)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Waits for every started thread to finish.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::error!(target: LOG_TARGET, "pd {}: thread panicked", self.name);
            }
        }
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let _ = self.platform.destroy_region_map(self.address_space);
        self.join();
        log::info!(target: LOG_TARGET, "pd {}: destroyed", self.name);
    }
}

/// Execution context of a domain; every access goes through the domain's region map.
///
/// An access to unbacked memory records a fault and suspends the caller
/// according to its [`Wait`] policy until a binding covers the address.
#[derive(Clone)]
pub struct DomainThread {
    platform: Arc<Platform>,
    address_space: RegionMapCap,
    wait: Wait,
}

impl DomainThread {
    /// Replaces the policy applied when an access faults.
    pub fn with_wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    fn rm(&self) -> Result<Arc<RegionMap>> {
        self.platform.region_map(self.address_space).map_err(|err| match err {
            Error::InvalidCapability(CapKind::RegionMap) => Error::Destroyed,
            other => other,
        })
    }

    /// Loads `buf.len()` bytes starting at `addr`.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.rm()?.read(&self.platform, addr, buf, self.wait)
    }

    /// Stores `bytes` starting at `addr`.
    pub fn write(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.rm()?.write(&self.platform, addr, bytes, self.wait)
    }

    /// Loads a little-endian `u32`.
    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Stores a little-endian `u32`.
    pub fn write_u32(&self, addr: usize, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Fetches one instruction byte.
    pub fn fetch(&self, addr: usize) -> Result<u8> {
        self.rm()?.fetch(&self.platform, addr, self.wait)
    }
}

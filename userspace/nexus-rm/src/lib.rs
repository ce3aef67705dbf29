// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level page-fault resolution over capability-invoked region maps
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest invariants, host e2e (tests/rm_fault_e2e)
//!
//! PUBLIC API:
//!   - Platform: enforcing layer owning all capability spaces
//!   - RegionMapClient: attach/attach_at/detach/fault_handler/state via capability
//!   - SignalReceiver/SignalContext/SignalTransmitter: one-shot asynchronous wakeups
//!   - ProtectionDomain/DomainThread: faulting execution context
//!   - FaultHandler: resolution loop (query, round, attach, absorb races)
//!   - RamAccount: quota-tracked dataspace allocator
//!
//! INVARIANTS:
//!   - Bindings of one region map never overlap
//!   - At most one outstanding fault per region map ("last write wins")
//!   - Signals are edge triggered, fault detail is level queried via `state()`
//!   - Every capability taken from a caller is checked before use

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod cap;
pub mod config;
pub mod dataspace;
pub mod handler;
pub mod pd;
pub mod platform;
pub mod region_map;
pub mod signal;

use core::fmt;
use core::time::Duration;

pub use cap::Cap;
pub use config::{ConfigError, RmConfig};
pub use dataspace::{Dataspace, DataspaceAllocator, DataspaceCap, RamAccount};
pub use handler::{BackingStore, DemandZero, FaultHandler, HandlerStats, Outcome, SharedBacking};
pub use pd::{DomainConfig, DomainThread, ProtectionDomain};
pub use platform::Platform;
pub use region_map::{
    Access, Attach, BindingInfo, FaultKind, FaultState, RegionMap, RegionMapCap, RegionMapClient, Rights,
};
pub use signal::{Signal, SignalContext, SignalContextCap, SignalReceiver, SignalTransmitter};

/// Log target shared by every module of the crate.
pub(crate) const LOG_TARGET: &str = "nexus-rm";

/// Result type returned by region-map operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

/// Object class a capability designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapKind {
    /// Backing memory object.
    Dataspace,
    /// Per-domain address-space abstraction.
    RegionMap,
    /// Asynchronous notification context.
    SignalContext,
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dataspace => "dataspace",
            Self::RegionMap => "region-map",
            Self::SignalContext => "signal-context",
        })
    }
}

/// Errors produced by the region-map subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Capability failed its validity check or designates a revoked object.
    #[error("invalid {0} capability")]
    InvalidCapability(CapKind),
    /// Requested range overlaps an existing binding.
    #[error("region {base:#x}+{size:#x} conflicts with an existing binding")]
    RegionConflict {
        /// Base of the rejected range.
        base: usize,
        /// Size of the rejected range.
        size: usize,
    },
    /// Size or offset exceed the dataspace.
    #[error("range {offset:#x}+{size:#x} exceeds dataspace of {limit:#x} bytes")]
    OutOfRange {
        /// Requested offset into the dataspace.
        offset: usize,
        /// Requested size.
        size: usize,
        /// Size of the dataspace.
        limit: usize,
    },
    /// Address or offset is not page aligned.
    #[error("{0:#x} is not page aligned")]
    Unaligned(usize),
    /// No free window of the requested size inside the managed range.
    #[error("no room for {size:#x} bytes in the address space")]
    OutOfAddressSpace {
        /// Requested size.
        size: usize,
    },
    /// Detach at an address without a binding.
    #[error("no binding at {0:#x}")]
    NoBinding(usize),
    /// RAM account cannot cover the allocation.
    #[error("ram quota exceeded: requested {requested:#x}, available {available:#x}")]
    QuotaExceeded {
        /// Bytes requested.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },
    /// Capability space has no free slot.
    #[error("{0} capability space exhausted")]
    CapSpaceFull(CapKind),
    /// Signal context is already managed by a receiver.
    #[error("signal context already managed")]
    AlreadyManaged,
    /// Region map was destroyed while the caller used it.
    #[error("region map destroyed")]
    Destroyed,
    /// The domain thread could not be started.
    #[error("failed to start domain thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// Operation could not progress without blocking.
    #[error("operation would block")]
    WouldBlock,
    /// The caller exceeded the requested timeout.
    #[error("operation timed out")]
    Timeout,
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Returns `true` for programming or security errors that must abort a resolution attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidCapability(_)
                | Self::OutOfRange { .. }
                | Self::Unaligned(_)
                | Self::Destroyed
                | Self::Config(_)
        )
    }
}

/// Rounds `addr` down to the page containing it.
pub(crate) const fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// Rounds `len` up to a whole number of pages, `None` on overflow.
pub(crate) fn page_ceil(len: usize, page_size: usize) -> Option<usize> {
    len.checked_add(page_size - 1).map(|v| v & !(page_size - 1))
}

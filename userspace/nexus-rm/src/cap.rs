// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed capability handles and generation-checked capability spaces
//! OWNERS: @runtime
//! PUBLIC API: Cap<T> (copyable, comparable token), CapSpace<T> (crate internal)
//! INVARIANTS: Generation 0 is never issued; a revoked slot bumps its generation so
//!             stale tokens fail lookup; the space never grows beyond its configured bound

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use std::sync::Arc;

/// Unforgeable reference token designating an object of type `T`.
///
/// A token is only meaningful to the [`Platform`](crate::Platform) that issued it;
/// holders must present it there to invoke operations on the object.
pub struct Cap<T> {
    slot: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Cap<T> {
    const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation, _kind: PhantomData }
    }

    /// Returns the null token that never designates an object.
    pub const fn invalid() -> Self {
        Self::new(0, 0)
    }

    /// Structural validity check; a valid-looking token may still be stale.
    pub const fn valid(&self) -> bool {
        self.generation != 0
    }

    /// Reconstructs a token received over the wire.
    pub const fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }

    /// Returns the wire representation of the token.
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }
}

impl<T> Clone for Cap<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cap<T> {}

impl<T> PartialEq for Cap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Cap<T> {}

impl<T> PartialOrd for Cap<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Cap<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.to_raw().cmp(&other.to_raw())
    }
}

impl<T> Hash for Cap<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> Default for Cap<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Cap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "Cap({}#{})", self.slot, self.generation)
        } else {
            f.write_str("Cap(invalid)")
        }
    }
}

struct Slot<T> {
    generation: u32,
    object: Option<Arc<T>>,
}

/// Bounded table mapping tokens to live objects.
pub(crate) struct CapSpace<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    limit: usize,
}

impl<T> CapSpace<T> {
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), limit }
    }

    /// Inserts `object`, returning `None` once the bound is reached.
    pub(crate) fn insert(&mut self, object: Arc<T>) -> Option<Cap<T>> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return Some(Cap::new(index, slot.generation));
        }
        if self.slots.len() >= self.limit {
            return None;
        }
        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot { generation: 1, object: Some(object) });
        Some(Cap::new(index, 1))
    }

    pub(crate) fn lookup(&self, cap: Cap<T>) -> Option<Arc<T>> {
        if !cap.valid() {
            return None;
        }
        let slot = self.slots.get(cap.slot as usize)?;
        if slot.generation != cap.generation {
            return None;
        }
        slot.object.clone()
    }

    /// Revokes `cap`; every copy of the token becomes stale.
    pub(crate) fn remove(&mut self, cap: Cap<T>) -> Option<Arc<T>> {
        self.lookup(cap)?;
        let slot = self.slots.get_mut(cap.slot as usize)?;
        let object = slot.object.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push(cap.slot);
        object
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Cap<T>, &Arc<T>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.object.as_ref().map(|object| (Cap::new(index as u32, slot.generation), object))
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

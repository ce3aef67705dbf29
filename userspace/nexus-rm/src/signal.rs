// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One-shot asynchronous notifications (signal contexts and receivers)
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - SignalContext::new(): handler-owned notification source
//!   - SignalReceiver::manage()/dissolve(): register/unregister a context
//!   - SignalReceiver::wait_for_signal(): block until >= 1 notification is pending
//!   - SignalTransmitter::submit(): fire a notification through a capability
//!
//! SEMANTICS:
//!   - Submits to a context that is already pending coalesce into one `Signal`
//!     whose `num` counts the folded submits
//!   - A delivered signal carries no payload; receivers must re-query state
//!   - After `dissolve`, pending and future submits for the context are dropped
//!
//! ERROR CONDITIONS:
//!   - Error::AlreadyManaged: context registered twice
//!   - Error::InvalidCapability: dissolve of a context this receiver does not manage
//!   - Error::WouldBlock / Error::Timeout: `Wait` policy expired without a signal

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::cap::Cap;
use crate::platform::Platform;
use crate::{CapKind, Error, Result, Wait, LOG_TARGET};

/// Capability designating a managed signal context.
pub type SignalContextCap = Cap<SignalSlot>;

/// A delivery reported by [`SignalReceiver::wait_for_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    /// Context that fired.
    pub context: SignalContextCap,
    /// Number of submits folded into this delivery.
    pub num: u32,
}

/// Platform-side half of a managed context.
pub struct SignalSlot {
    receiver: Weak<ReceiverShared>,
}

impl SignalSlot {
    pub(crate) fn submit(&self, cap: SignalContextCap) -> bool {
        self.receiver.upgrade().is_some_and(|receiver| receiver.deliver(cap))
    }
}

#[derive(Default)]
struct ReceiverState {
    pending: VecDeque<Signal>,
    managed: Vec<SignalContextCap>,
}

struct ReceiverShared {
    state: Mutex<ReceiverState>,
    cond: Condvar,
}

impl ReceiverShared {
    fn deliver(&self, cap: SignalContextCap) -> bool {
        let mut state = self.state.lock();
        if !state.managed.contains(&cap) {
            return false;
        }
        match state.pending.iter_mut().find(|signal| signal.context == cap) {
            Some(signal) => signal.num = signal.num.saturating_add(1),
            None => state.pending.push_back(Signal { context: cap, num: 1 }),
        }
        self.cond.notify_one();
        true
    }
}

struct Binding {
    cap: SignalContextCap,
    platform: Arc<Platform>,
    receiver: Weak<ReceiverShared>,
}

impl Binding {
    fn live(&self) -> bool {
        self.receiver.strong_count() > 0
    }
}

/// Notification source owned by the handler.
///
/// Dropping a managed context dissolves it. A context whose receiver is gone
/// counts as unmanaged and may be managed again.
#[derive(Default)]
pub struct SignalContext {
    binding: Mutex<Option<Binding>>,
}

impl SignalContext {
    /// Creates an unmanaged context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability of the context while it is managed.
    pub fn cap(&self) -> Option<SignalContextCap> {
        self.binding.lock().as_ref().filter(|binding| binding.live()).map(|binding| binding.cap)
    }
}

impl Drop for SignalContext {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            if let Some(receiver) = binding.receiver.upgrade() {
                let mut state = receiver.state.lock();
                state.managed.retain(|cap| *cap != binding.cap);
                state.pending.retain(|signal| signal.context != binding.cap);
            }
            if binding.platform.revoke_signal(binding.cap).is_some() {
                log::error!(target: LOG_TARGET, "signal: context {:?} destroyed while managed", binding.cap);
            }
        }
    }
}

/// Endpoint that blocks until one of its managed contexts fires.
pub struct SignalReceiver {
    platform: Arc<Platform>,
    shared: Arc<ReceiverShared>,
}

impl SignalReceiver {
    /// Creates a receiver without managed contexts.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            shared: Arc::new(ReceiverShared { state: Mutex::new(ReceiverState::default()), cond: Condvar::new() }),
        }
    }

    /// Registers `context` and returns the capability fired to wake this receiver.
    pub fn manage(&self, context: &SignalContext) -> Result<SignalContextCap> {
        let mut binding = context.binding.lock();
        if binding.as_ref().is_some_and(Binding::live) {
            return Err(Error::AlreadyManaged);
        }
        let receiver = Arc::downgrade(&self.shared);
        let cap = self.platform.create_signal(SignalSlot { receiver: receiver.clone() })?;
        self.shared.state.lock().managed.push(cap);
        *binding = Some(Binding { cap, platform: self.platform.clone(), receiver });
        log::debug!(target: LOG_TARGET, "signal: manage {cap:?}");
        Ok(cap)
    }

    /// Unregisters `context`; no further wakeups are attributed to it.
    pub fn dissolve(&self, context: &SignalContext) -> Result<()> {
        let mut binding = context.binding.lock();
        let cap = binding
            .as_ref()
            .map(|binding| binding.cap)
            .ok_or(Error::InvalidCapability(CapKind::SignalContext))?;
        {
            let mut state = self.shared.state.lock();
            let index = state
                .managed
                .iter()
                .position(|candidate| *candidate == cap)
                .ok_or(Error::InvalidCapability(CapKind::SignalContext))?;
            state.managed.swap_remove(index);
            state.pending.retain(|signal| signal.context != cap);
        }
        self.platform.revoke_signal(cap);
        *binding = None;
        log::debug!(target: LOG_TARGET, "signal: dissolve {cap:?}");
        Ok(())
    }

    /// Suspends the caller until at least one notification is pending.
    ///
    /// A returned signal only means "go check": the state it hints at may already be gone.
    pub fn wait_for_signal(&self, wait: Wait) -> Result<Signal> {
        let deadline = wait.timeout().map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(signal) = state.pending.pop_front() {
                return Ok(signal);
            }
            match (wait, deadline) {
                (Wait::NonBlocking, _) => return Err(Error::WouldBlock),
                (_, Some(deadline)) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.pending.pop_front().ok_or(Error::Timeout);
                    }
                }
                (_, None) => self.shared.cond.wait(&mut state),
            }
        }
    }

    /// Returns `true` when a call to `wait_for_signal` would not block.
    pub fn pending(&self) -> bool {
        !self.shared.state.lock().pending.is_empty()
    }
}

impl Drop for SignalReceiver {
    fn drop(&mut self) {
        let managed = std::mem::take(&mut self.shared.state.lock().managed);
        for cap in managed {
            self.platform.revoke_signal(cap);
        }
    }
}

/// Sender half: anyone holding the capability may fire the context.
#[derive(Clone)]
pub struct SignalTransmitter {
    platform: Arc<Platform>,
    cap: SignalContextCap,
}

impl SignalTransmitter {
    /// Creates a transmitter for `cap`.
    pub fn new(platform: Arc<Platform>, cap: SignalContextCap) -> Self {
        Self { platform, cap }
    }

    /// Fires one notification; returns `false` when the context is no longer managed.
    pub fn submit(&self) -> bool {
        self.platform.submit(self.cap)
    }
}

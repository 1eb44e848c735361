/*
 * Nested modal loops. `enter` pumps events on the bound thread until the
 * dispatcher disappears, the queue reports shutdown, or a termination request
 * is observed, then hands back the value carried by that request.
 *
 * The request is shared by all loops rather than owned by one, so it always
 * stops whichever loop is innermost and polling. Flag and value are written
 * together under one lock; the flag itself is atomic so loops can poll it
 * without locking.
 *
 * If a window handler unwinds through `enter`, the depth is restored and any
 * pending request is cleared before the panic continues outwards.
 */

use crate::deferred::DeferredQueue;
use crate::dispatcher::Dispatcher;
use crate::platform::{Platform, PumpOutcome};

use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque value handed from `leave_nested_loop` to the caller of `enter_nested_loop`.
pub type LoopValue = Box<dyn Any + Send>;

#[derive(Default)]
pub(crate) struct NestedLoopState {
    leave_requested: AtomicBool,
    return_value: Mutex<Option<LoopValue>>,
}

impl NestedLoopState {
    pub(crate) fn request_leave(&self, value: Option<LoopValue>) {
        let mut slot = self.return_value.lock();
        *slot = value;
        self.leave_requested.store(true, Ordering::Release);
    }

    pub(crate) fn leave_requested(&self) -> bool {
        self.leave_requested.load(Ordering::Acquire)
    }

    /// Clears a request left over from a time no loop was running. Returns true if one was found.
    fn absorb_stale(&self) -> bool {
        let mut slot = self.return_value.lock();
        let stale = self.leave_requested.swap(false, Ordering::AcqRel);
        if stale {
            slot.take();
        }
        stale
    }

    fn finish(&self) -> Option<LoopValue> {
        let mut slot = self.return_value.lock();
        self.leave_requested.store(false, Ordering::Release);
        slot.take()
    }
}

struct LoopLevel<'a> {
    depth: &'a Cell<usize>,
    level: usize,
    state: &'a NestedLoopState,
}

impl Drop for LoopLevel<'_> {
    fn drop(&mut self) {
        self.depth.set(self.level - 1);
        if std::thread::panicking() {
            self.state.finish();
            log::error!("NestedLoop: unwinding out of loop at depth {}.", self.level);
        }
    }
}

#[derive(Default)]
pub(crate) struct NestedLoopCoordinator {
    depth: Cell<usize>,
}

impl NestedLoopCoordinator {
    pub(crate) fn depth(&self) -> usize {
        self.depth.get()
    }

    pub(crate) fn enter(
        &self,
        platform: &dyn Platform,
        dispatcher: &Dispatcher,
        deferred: &DeferredQueue,
    ) -> Option<LoopValue> {
        let state = dispatcher.nested_loop_state();
        if state.absorb_stale() {
            log::debug!("NestedLoop: discarded a termination request made while no loop was running.");
        }

        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        let level = LoopLevel {
            depth: &self.depth,
            level: depth,
            state,
        };
        log::debug!("NestedLoop: entering loop at depth {depth}.");

        loop {
            deferred.run_pending();
            if !dispatcher.is_active() {
                log::debug!("NestedLoop: dispatcher gone, leaving loop at depth {depth}.");
                break;
            }
            if state.leave_requested() {
                break;
            }
            if let PumpOutcome::Quit(exit_code) = platform.pump_one(true) {
                log::debug!("NestedLoop: queue shut down at depth {depth}; passing quit outwards.");
                platform.post_quit(exit_code);
                break;
            }
        }

        drop(level);
        let value = state.finish();
        log::debug!(
            "NestedLoop: left loop at depth {depth} (value present: {}).",
            value.is_some()
        );
        value
    }
}

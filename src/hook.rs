/*
 * Shared pointer hook arbiter. Independent callers request the process-wide
 * low-level pointer hook; the OS hook is installed when the request count goes
 * from 0 to 1 and removed when it returns to 0. Bound-thread only.
 *
 * The hook callback never consumes events. A press that lands on a window
 * this process did not register triggers the grab-reset side effect, then the
 * backend forwards the event down the chain untouched.
 */

use crate::error::Result as PlatformResult;
use crate::platform::Platform;
use crate::registry::WindowRegistry;
use crate::types::{HookHandle, PointerHookEvent};

use std::cell::Cell;

#[derive(Default)]
pub(crate) struct HookArbiter {
    requests: Cell<u32>,
    hook: Cell<Option<HookHandle>>,
}

impl HookArbiter {
    pub(crate) fn acquire(&self, platform: &dyn Platform) -> PlatformResult<()> {
        let requests = self.requests.get() + 1;
        log::debug!("HookArbiter: acquire (requests = {requests}).");
        if requests == 1 {
            let hook = platform.install_pointer_hook().inspect_err(|err| {
                log::error!("HookArbiter: installing pointer hook failed: {err}");
            })?;
            self.hook.set(Some(hook));
        }
        self.requests.set(requests);
        Ok(())
    }

    pub(crate) fn release(&self, platform: &dyn Platform) {
        let requests = self.requests.get();
        if requests == 0 {
            log::warn!("HookArbiter: release without a matching acquire; ignored.");
            return;
        }
        self.requests.set(requests - 1);
        log::debug!("HookArbiter: release (requests = {}).", requests - 1);
        if requests == 1 {
            if let Some(hook) = self.hook.take() {
                if let Err(err) = platform.uninstall_pointer_hook(hook) {
                    log::error!("HookArbiter: removing pointer hook {hook:?} failed: {err}");
                }
            }
        }
    }

    pub(crate) fn requests(&self) -> u32 {
        self.requests.get()
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.hook.get().is_some()
    }
}

/// True when `event` is a press on a top-level window that has no registration.
pub(crate) fn targets_foreign_window(
    event: &PointerHookEvent,
    platform: &dyn Platform,
    registry: &WindowRegistry,
) -> bool {
    if !event.kind.is_press() {
        return false;
    }
    let root = platform
        .window_from_point(event.point)
        .and_then(|window| platform.root_ancestor(window));
    match root {
        Some(root) => !registry.contains(root),
        None => true,
    }
}

/*
 * Window registration registry. Associates each native window handle with
 * the controller that owns it, in an explicit table instead of per-window
 * OS properties, and owns the controller's destruction: the registration is
 * the controller's only long-lived owner. Lookups hand out weak references,
 * so nothing outside an in-flight handler can keep a controller alive past
 * its window's terminal notification.
 *
 * Every window gets its own window class whose name is derived from the
 * controller type and a monotonically increasing counter. The class can only
 * be released once the window is fully gone, so release is queued on the
 * deferred queue from the terminal destruction notification rather than
 * attempted inline.
 *
 * All state here is bound-thread only (`Cell`/`RefCell`); callers serialize
 * registration simply by being on that thread.
 */

use crate::action::Action;
use crate::deferred::DeferredQueue;
use crate::error::{PlatformError, Result as PlatformResult};
use crate::platform::Platform;
use crate::types::{
    ClassDescriptor, ClassToken, CursorHandle, MessageResult, WindowHandle, WindowMessage,
    WindowParams,
};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// The object that owns a native window and handles its messages.
///
/// Handlers take `&self`: a controller may be re-entered while one of its
/// handlers is still running (nested loops, synchronous sends to itself).
pub trait WindowController {
    /// Distinguishes the generated class names of different controller types.
    fn class_name_suffix(&self) -> &str;

    fn handle_message(&self, window: WindowHandle, message: WindowMessage) -> MessageResult;
}

pub(crate) struct WindowRegistration {
    handle: WindowHandle,
    controller: Rc<dyn WindowController>,
    class_token: Option<ClassToken>,
    ancestor: Option<WindowHandle>,
    cursor: Cell<CursorHandle>,
}

impl WindowRegistration {
    pub(crate) fn controller(&self) -> Rc<dyn WindowController> {
        Rc::clone(&self.controller)
    }

    pub(crate) fn class_token(&self) -> Option<ClassToken> {
        self.class_token
    }

    pub(crate) fn handle(&self) -> WindowHandle {
        self.handle
    }
}

impl Drop for WindowRegistration {
    fn drop(&mut self) {
        log::debug!(
            "Registry: registration for {:?} dropped, controller released.",
            self.handle
        );
    }
}

// A window whose creation is in flight and whose handle is not known yet.
struct PendingWindow {
    controller: Rc<dyn WindowController>,
    class_token: ClassToken,
    ancestor: Option<WindowHandle>,
    cursor: CursorHandle,
}

pub(crate) struct WindowRegistry {
    platform: Arc<dyn Platform>,
    class_name_prefix: String,
    class_name_counter: Cell<u32>,
    windows: RefCell<HashMap<WindowHandle, Rc<WindowRegistration>>>,
    pending: RefCell<Vec<PendingWindow>>,
}

impl WindowRegistry {
    pub(crate) fn new(platform: Arc<dyn Platform>, class_name_prefix: String) -> Self {
        Self {
            platform,
            class_name_prefix,
            class_name_counter: Cell::new(0),
            windows: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
        }
    }

    fn next_class_name(&self, suffix: &str) -> String {
        let counter = self.class_name_counter.get() + 1;
        self.class_name_counter.set(counter);
        format!("{}-{}-{}", self.class_name_prefix, suffix, counter)
    }

    /*
     * Registers a fresh window class and creates the native window. The
     * association itself happens in `associate`, called from the window
     * procedure when the creation notification arrives, so the controller is
     * reachable for every message from that point on.
     */
    pub(crate) fn create(
        &self,
        controller: Box<dyn WindowController>,
        params: &WindowParams,
        ancestor: Option<WindowHandle>,
    ) -> PlatformResult<WindowHandle> {
        let class_name = self.next_class_name(controller.class_name_suffix());
        let cursor = self.platform.default_cursor();
        let class_token = self
            .platform
            .register_class(&ClassDescriptor {
                name: class_name.clone(),
                cursor,
            })
            .map_err(|err| {
                log::error!("Registry: registering class '{class_name}' failed: {err}");
                PlatformError::CreationFailed(format!(
                    "class registration for '{class_name}' failed: {err}"
                ))
            })?;

        let depth = self.pending.borrow().len();
        self.pending.borrow_mut().push(PendingWindow {
            controller: Rc::from(controller),
            class_token,
            ancestor,
            cursor,
        });

        let created = self.platform.create_window(class_token, params);

        let unassociated = {
            let mut pending = self.pending.borrow_mut();
            if pending.len() > depth {
                pending.pop()
            } else {
                None
            }
        };

        match (created, unassociated) {
            (Ok(handle), None) if self.contains(handle) => {
                log::debug!("Registry: created {handle:?} with class '{class_name}'.");
                Ok(handle)
            }
            (Ok(handle), None) => {
                // Associated, then torn down before creation returned. Class release is already queued.
                Err(PlatformError::CreationFailed(format!(
                    "window {handle:?} was destroyed during creation"
                )))
            }
            (Ok(handle), Some(pending)) => {
                log::error!("Registry: {handle:?} never delivered its creation notification.");
                if let Err(err) = self.platform.destroy_window(handle) {
                    log::error!("Registry: destroying unassociated {handle:?} failed: {err}");
                }
                self.release_class_now(pending.class_token);
                Err(PlatformError::CreationFailed(format!(
                    "window {handle:?} was never associated with its controller"
                )))
            }
            (Err(err), unassociated) => {
                log::error!("Registry: creating window '{}' failed: {err}", params.name);
                if let Some(pending) = unassociated {
                    self.release_class_now(pending.class_token);
                }
                Err(PlatformError::CreationFailed(format!(
                    "creating window '{}' failed: {err}",
                    params.name
                )))
            }
        }
    }

    fn release_class_now(&self, token: ClassToken) {
        if let Err(err) = self.platform.unregister_class(token) {
            log::error!("Registry: unregistering class {token:?} failed: {err}");
        }
    }

    /// Binds the innermost in-flight creation to `handle`. Called on the creation notification.
    pub(crate) fn associate(&self, handle: WindowHandle) -> Option<Rc<WindowRegistration>> {
        let pending = self.pending.borrow_mut().pop()?;
        let registration = Rc::new(WindowRegistration {
            handle,
            controller: pending.controller,
            class_token: Some(pending.class_token),
            ancestor: pending.ancestor,
            cursor: Cell::new(pending.cursor),
        });
        let previous = self
            .windows
            .borrow_mut()
            .insert(handle, Rc::clone(&registration));
        if previous.is_some() {
            log::warn!("Registry: {handle:?} was already registered; replacing stale entry.");
        }
        Some(registration)
    }

    pub(crate) fn registration(&self, handle: WindowHandle) -> Option<Rc<WindowRegistration>> {
        self.windows.borrow().get(&handle).cloned()
    }

    pub(crate) fn lookup(&self, handle: WindowHandle) -> Option<Weak<dyn WindowController>> {
        self.registration(handle)
            .map(|registration| Rc::downgrade(&registration.controller))
    }

    pub(crate) fn contains(&self, handle: WindowHandle) -> bool {
        self.windows.borrow().contains_key(&handle)
    }

    pub(crate) fn ancestor(&self, handle: WindowHandle) -> Option<WindowHandle> {
        self.registration(handle)
            .and_then(|registration| registration.ancestor)
    }

    pub(crate) fn len(&self) -> usize {
        self.windows.borrow().len()
    }

    /*
     * Removes the registration on the terminal destruction notification and
     * queues release of its class. The controller is freed once the last
     * in-flight handler holding it returns.
     */
    pub(crate) fn destroy(&self, handle: WindowHandle, deferred: &DeferredQueue) {
        let removed = self.windows.borrow_mut().remove(&handle);
        let Some(registration) = removed else {
            log::warn!("Registry: destroy for unregistered {handle:?} ignored.");
            return;
        };
        if let Some(token) = registration.class_token {
            let platform = Arc::clone(&self.platform);
            deferred.push_action(Action::deferred(move || {
                match platform.unregister_class(token) {
                    Ok(()) => log::debug!("Registry: class {token:?} unregistered."),
                    Err(err) => log::error!("Registry: unregistering class {token:?} failed: {err}"),
                }
            }));
        }
        log::debug!("Registry: {handle:?} unregistered.");
    }

    /*
     * Updates the pointer resource and applies it immediately. Only meant to be
     * called while handling pointer motion; the pointer position is not
     * re-checked.
     */
    pub(crate) fn set_cursor(&self, handle: WindowHandle, cursor: CursorHandle) -> PlatformResult<()> {
        let registration = self.registration(handle).ok_or_else(|| {
            PlatformError::InvalidHandle(format!("{handle:?} is not a registered window"))
        })?;
        registration.cursor.set(cursor);
        self.platform.apply_cursor(cursor);
        Ok(())
    }

    pub(crate) fn apply_current_cursor(&self, registration: &WindowRegistration) {
        self.platform.apply_cursor(registration.cursor.get());
    }

    pub(crate) fn take_all(&self) -> Vec<Rc<WindowRegistration>> {
        self.windows
            .borrow_mut()
            .drain()
            .map(|(_, registration)| registration)
            .collect()
    }
}

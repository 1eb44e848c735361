/*
 * The seam between the coordination core and the OS windowing subsystem.
 * `Platform` lists the primitives the core consumes (class registration,
 * window creation, cross-thread send/post, the event pump and the global
 * pointer hook); `WindowProc` is what the core hands back so the backend can
 * deliver window messages and hook events on the bound thread.
 *
 * The sink lives in a thread-local slot: window procedures and low-level
 * hooks only ever run on the thread that owns the windows, so the slot of
 * that thread is the one consulted. A thread holds at most one live sink;
 * binding a second one while the first is alive is refused.
 */

use crate::error::{PlatformError, Result as PlatformResult};
use crate::types::{
    ClassDescriptor, ClassToken, CursorHandle, HookHandle, MessageResult, Point,
    PointerHookEvent, WindowHandle, WindowMessage, WindowParams,
};

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Outcome of one iteration of the native event pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// One event was retrieved and dispatched.
    Dispatched,
    /// Nothing was queued (only returned when not waiting).
    Idle,
    /// The queue reported shutdown with this exit code.
    Quit(i32),
}

/// Receiver of everything the backend delivers on the bound thread.
pub trait WindowProc {
    fn window_proc(&self, window: WindowHandle, message: WindowMessage) -> MessageResult;

    /// Observes a global pointer event. The backend forwards the event down the hook chain afterwards.
    fn pointer_hook(&self, event: &PointerHookEvent);
}

pub trait Platform: Send + Sync {
    /// Attaches the sink for the calling thread, which becomes the bound thread.
    /// Fails if the thread already has a live sink.
    fn bind_window_proc(&self, window_proc: Weak<dyn WindowProc>) -> PlatformResult<()>;

    fn unbind_window_proc(&self);

    fn register_class(&self, class: &ClassDescriptor) -> PlatformResult<ClassToken>;

    fn unregister_class(&self, token: ClassToken) -> PlatformResult<()>;

    /// Creates a window. `Created` is delivered to the sink before this returns.
    fn create_window(&self, class: ClassToken, params: &WindowParams)
    -> PlatformResult<WindowHandle>;

    /// Destroys a window. `Destroying` and `Destroyed` are delivered before this returns.
    fn destroy_window(&self, window: WindowHandle) -> PlatformResult<()>;

    fn is_window(&self, window: WindowHandle) -> bool;

    /// Blocking send. Returns the message back when it could not be delivered.
    fn send_message(
        &self,
        target: WindowHandle,
        message: WindowMessage,
    ) -> Result<MessageResult, WindowMessage>;

    /// Non-blocking post. Returns the message back when it could not be queued.
    fn post_message(&self, target: WindowHandle, message: WindowMessage)
    -> Result<(), WindowMessage>;

    fn pump_one(&self, wait: bool) -> PumpOutcome;

    /// Waits at most `timeout` for one event and dispatches it.
    fn pump_one_within(&self, timeout: Duration) -> PumpOutcome;

    fn post_quit(&self, exit_code: i32);

    fn install_pointer_hook(&self) -> PlatformResult<HookHandle>;

    fn uninstall_pointer_hook(&self, hook: HookHandle) -> PlatformResult<()>;

    fn window_from_point(&self, point: Point) -> Option<WindowHandle>;

    fn root_ancestor(&self, window: WindowHandle) -> Option<WindowHandle>;

    fn apply_cursor(&self, cursor: CursorHandle);

    fn default_cursor(&self) -> CursorHandle;

    /// Joins the clipboard-viewer chain. Returns the viewer that was first before.
    fn set_clipboard_viewer(&self, window: WindowHandle) -> PlatformResult<Option<WindowHandle>>;

    /// Removes `window` from the clipboard-viewer chain, linking `next` in its place.
    fn change_clipboard_chain(
        &self,
        window: WindowHandle,
        next: Option<WindowHandle>,
    ) -> PlatformResult<()>;
}

thread_local! {
    static BOUND_WINDOW_PROC: RefCell<Option<Weak<dyn WindowProc>>> = const { RefCell::new(None) };
}

pub(crate) fn bind_thread_window_proc(window_proc: Weak<dyn WindowProc>) -> PlatformResult<()> {
    BOUND_WINDOW_PROC.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|bound| bound.strong_count() > 0) {
            log::warn!("Platform: thread already has a live window procedure; bind refused.");
            return Err(PlatformError::InitializationFailed(
                "a toolkit is already bound to this thread".to_string(),
            ));
        }
        *slot = Some(window_proc);
        Ok(())
    })
}

pub(crate) fn unbind_thread_window_proc() {
    BOUND_WINDOW_PROC.with(|slot| *slot.borrow_mut() = None);
}

/// Returns the sink bound to the current thread, if it is still alive.
pub(crate) fn thread_window_proc() -> Option<Rc<dyn WindowProc>> {
    BOUND_WINDOW_PROC.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
}

/*
 * The toolkit context: an explicitly owned object living on the bound thread
 * that ties the window registry, the dispatcher, nested loops and the shared
 * pointer hook together. It is `!Send`; the only pieces other threads may
 * touch are reached through `Dispatcher`, which is handed out by
 * `Toolkit::dispatcher`.
 *
 * `ToolkitInner` is also the window procedure the backend calls for every
 * registered window: it resolves the registration, applies the shared cursor
 * handling, forwards the message to the controller and, on the terminal
 * destruction notification, tears the registration down.
 *
 * Only one toolkit can be bound to a thread at a time.
 */

use crate::config::ToolkitConfig;
use crate::coordination::{CoordinationState, CoordinationWindow};
use crate::deferred::DeferredQueue;
use crate::dispatcher::Dispatcher;
use crate::error::{PlatformError, Result as PlatformResult};
use crate::hook::{self, HookArbiter};
use crate::nested_loop::{LoopValue, NestedLoopCoordinator};
use crate::platform::{Platform, PumpOutcome, WindowProc};
use crate::registry::{WindowController, WindowRegistry};
use crate::types::{
    CursorHandle, MessageResult, PointerHookEvent, SystemNotification, WindowHandle,
    WindowMessage, WindowParams, WindowStyle,
};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

const CURSOR_HANDLED: isize = 1;

struct ToolkitInner {
    platform: Arc<dyn Platform>,
    dispatcher: Dispatcher,
    registry: WindowRegistry,
    deferred: DeferredQueue,
    hooks: HookArbiter,
    nested: NestedLoopCoordinator,
    grab_reset: RefCell<Option<Rc<dyn Fn()>>>,
    coordination_window: Cell<Option<WindowHandle>>,
    coordination: Rc<CoordinationState>,
    accessibility_settle_timeout: Duration,
    bound: Cell<bool>,
}

#[derive(Clone)]
pub struct Toolkit {
    inner: Rc<ToolkitInner>,
}

impl Toolkit {
    /*
     * Binds the toolkit to the calling thread and creates the coordination
     * window. The dispatcher becomes active when that window's creation
     * notification is handled.
     */
    pub fn new(platform: Arc<dyn Platform>, config: ToolkitConfig) -> PlatformResult<Self> {
        let dispatcher = Dispatcher::new(Arc::clone(&platform));
        let inner = Rc::new(ToolkitInner {
            registry: WindowRegistry::new(Arc::clone(&platform), config.class_name_prefix.clone()),
            platform,
            dispatcher,
            deferred: DeferredQueue::new(),
            hooks: HookArbiter::default(),
            nested: NestedLoopCoordinator::default(),
            grab_reset: RefCell::new(None),
            coordination_window: Cell::new(None),
            coordination: Rc::new(CoordinationState::default()),
            accessibility_settle_timeout: config.accessibility_settle_timeout,
            bound: Cell::new(false),
        });
        let window_proc: Weak<dyn WindowProc> = Rc::downgrade(&inner) as Weak<dyn WindowProc>;
        inner.platform.bind_window_proc(window_proc)?;
        inner.bound.set(true);

        let controller = Box::new(CoordinationWindow::new(
            inner.dispatcher.clone(),
            config.coordination_class_suffix.clone(),
            Rc::clone(&inner.coordination),
        ));
        let params = WindowParams {
            parent: None,
            bounds: config.coordination_bounds,
            style: WindowStyle::default(),
            name: String::new(),
        };
        let handle = inner
            .registry
            .create(controller, &params, None)
            .map_err(|err| {
                PlatformError::InitializationFailed(format!(
                    "coordination window could not be created: {err}"
                ))
            })?;
        inner.coordination_window.set(Some(handle));

        if !inner.dispatcher.is_active() {
            return Err(PlatformError::InitializationFailed(format!(
                "coordination window {handle:?} did not activate the dispatcher"
            )));
        }
        log::debug!(
            "Toolkit: coordination window {handle:?} ready on {:?}.",
            inner.dispatcher.bound_thread()
        );
        Ok(Self { inner })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.inner.dispatcher.clone()
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    pub fn coordination_window(&self) -> Option<WindowHandle> {
        self.inner.dispatcher.coordination_window()
    }

    /// Creates a native window owned by `controller`. The toolkit keeps the controller until the window is destroyed.
    pub fn create_window(
        &self,
        controller: impl WindowController + 'static,
        params: &WindowParams,
        ancestor: Option<WindowHandle>,
    ) -> PlatformResult<WindowHandle> {
        self.inner
            .registry
            .create(Box::new(controller), params, ancestor)
    }

    /// The controller of a live window. The reference stops upgrading once the window is destroyed.
    pub fn lookup(&self, window: WindowHandle) -> Option<Weak<dyn WindowController>> {
        self.inner.registry.lookup(window)
    }

    pub fn ancestor(&self, window: WindowHandle) -> Option<WindowHandle> {
        self.inner.registry.ancestor(window)
    }

    pub fn window_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Starts native destruction. The registration goes away with the terminal notification.
    pub fn destroy_window(&self, window: WindowHandle) -> PlatformResult<()> {
        if !self.inner.registry.contains(window) {
            return Err(PlatformError::InvalidHandle(format!(
                "{window:?} is not a registered window"
            )));
        }
        self.inner.platform.destroy_window(window)
    }

    pub fn set_cursor(&self, window: WindowHandle, cursor: CursorHandle) -> PlatformResult<()> {
        self.inner.registry.set_cursor(window, cursor)
    }

    /// Pumps events until `leave_nested_loop` is called, the dispatcher goes away or the queue shuts down.
    pub fn enter_nested_loop(&self) -> Option<LoopValue> {
        let inner = &self.inner;
        inner
            .nested
            .enter(inner.platform.as_ref(), &inner.dispatcher, &inner.deferred)
    }

    pub fn leave_nested_loop(&self, value: Option<LoopValue>) {
        self.inner.dispatcher.leave_nested_loop(value);
    }

    pub fn nested_loop_depth(&self) -> usize {
        self.inner.nested.depth()
    }

    pub fn acquire_pointer_hook(&self) -> PlatformResult<()> {
        self.inner.hooks.acquire(self.inner.platform.as_ref())
    }

    pub fn release_pointer_hook(&self) {
        self.inner.hooks.release(self.inner.platform.as_ref());
    }

    pub fn pointer_hook_requests(&self) -> u32 {
        self.inner.hooks.requests()
    }

    /// Side effect run when a press lands on a window this toolkit does not own.
    pub fn set_grab_reset(&self, reset: impl Fn() + 'static) {
        *self.inner.grab_reset.borrow_mut() = Some(Rc::new(reset));
    }

    /*
     * Installs the receiver of system-wide notifications. For a theme change
     * its answer becomes the result of the native notification: true means
     * handled. Work-area and display changes also get default handling.
     */
    pub fn set_system_notification_handler(
        &self,
        handler: impl Fn(SystemNotification) -> bool + 'static,
    ) {
        self.inner.coordination.set_system_handler(Rc::new(handler));
    }

    /*
     * Joins the clipboard-viewer chain through the coordination window;
     * `listener` runs on every clipboard change. Registering again only
     * replaces the listener. The chain is left automatically when the
     * coordination window is destroyed.
     */
    pub fn register_clipboard_viewer(&self, listener: impl Fn() + 'static) -> PlatformResult<()> {
        let window = self.active_coordination_window()?;
        self.inner
            .coordination
            .join_clipboard_chain(self.inner.platform.as_ref(), window, Rc::new(listener))
    }

    pub fn unregister_clipboard_viewer(&self) -> PlatformResult<()> {
        let window = self.active_coordination_window()?;
        self.inner
            .coordination
            .leave_clipboard_chain(self.inner.platform.as_ref(), window)
    }

    pub fn is_clipboard_viewer(&self) -> bool {
        self.inner.coordination.is_clipboard_viewer()
    }

    fn active_coordination_window(&self) -> PlatformResult<WindowHandle> {
        self.coordination_window().ok_or_else(|| {
            PlatformError::InvalidHandle("the coordination window is gone".to_string())
        })
    }

    /// Runs `task` on this thread once the current callback has returned.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.deferred.push(task);
    }

    pub fn pending_deferred_tasks(&self) -> usize {
        self.inner.deferred.len()
    }

    /*
     * Runs `launch`, then pumps events until the dispatcher disappears or the
     * queue reports shutdown. While accessibility clients are connected, one
     * more event is waited for (bounded by the configured settle timeout) so
     * their final release requests are still served.
     */
    pub fn run_loop(&self, launch: impl FnOnce()) {
        let inner = &self.inner;
        launch();
        loop {
            inner.deferred.run_pending();
            if !inner.dispatcher.is_active() {
                log::debug!("Toolkit: dispatcher gone, main loop ends.");
                break;
            }
            if let PumpOutcome::Quit(exit_code) = inner.platform.pump_one(true) {
                log::debug!("Toolkit: main loop received quit ({exit_code}).");
                break;
            }
        }
        let clients = inner.dispatcher.accessibility_count();
        if clients > 0 {
            log::debug!("Toolkit: {clients} accessibility client(s) connected; servicing a last event.");
            inner.platform.pump_one_within(inner.accessibility_settle_timeout);
        }
        inner.deferred.run_pending();
    }

    /// Destroys the coordination window, which ends every running loop.
    pub fn terminate_loop(&self) -> PlatformResult<()> {
        match self.inner.coordination_window.get() {
            Some(window) if self.inner.platform.is_window(window) => {
                log::debug!("Toolkit: terminating, destroying coordination window {window:?}.");
                self.inner.platform.destroy_window(window)
            }
            _ => Ok(()),
        }
    }

    /// Dispatches everything currently queued without blocking. Returns the number of events handled.
    pub fn pump_pending(&self) -> usize {
        let inner = &self.inner;
        let mut dispatched = 0;
        loop {
            inner.deferred.run_pending();
            match inner.platform.pump_one(false) {
                PumpOutcome::Dispatched => dispatched += 1,
                PumpOutcome::Idle => break,
                PumpOutcome::Quit(exit_code) => {
                    inner.platform.post_quit(exit_code);
                    break;
                }
            }
        }
        inner.deferred.run_pending();
        dispatched
    }
}

impl WindowProc for ToolkitInner {
    fn window_proc(&self, window: WindowHandle, message: WindowMessage) -> MessageResult {
        let registration = match message {
            WindowMessage::Created => self
                .registry
                .registration(window)
                .or_else(|| self.registry.associate(window)),
            _ => self.registry.registration(window),
        };
        let Some(registration) = registration else {
            return None;
        };

        if let WindowMessage::SetCursor { client_area: true } = message {
            self.registry.apply_current_cursor(&registration);
            return Some(CURSOR_HANDLED);
        }

        let terminal = matches!(message, WindowMessage::Destroyed);
        let result = registration.controller().handle_message(window, message);
        if terminal {
            drop(registration);
            self.registry.destroy(window, &self.deferred);
        }
        result
    }

    fn pointer_hook(&self, event: &PointerHookEvent) {
        if !hook::targets_foreign_window(event, self.platform.as_ref(), &self.registry) {
            return;
        }
        let reset = self.grab_reset.borrow().clone();
        if let Some(reset) = reset {
            log::debug!("Toolkit: press on a foreign window at {:?}; resetting grab.", event.point);
            reset();
        }
    }
}

impl Drop for ToolkitInner {
    fn drop(&mut self) {
        if let Some(window) = self.coordination_window.get() {
            // Registrations are taken below, so the controller never sees Destroying.
            if let Err(err) = self
                .coordination
                .leave_clipboard_chain(self.platform.as_ref(), window)
            {
                log::error!("Toolkit: leaving the clipboard chain on shutdown failed: {err}");
            }
        }
        self.dispatcher.detach_any();
        if self.bound.get() {
            self.platform.unbind_window_proc();
        }
        if self.hooks.is_installed() {
            log::warn!(
                "Toolkit: dropped with {} outstanding pointer hook request(s).",
                self.hooks.requests()
            );
            while self.hooks.requests() > 0 {
                self.hooks.release(self.platform.as_ref());
            }
        }
        for registration in self.registry.take_all() {
            let window = registration.handle();
            if self.platform.is_window(window) {
                if let Err(err) = self.platform.destroy_window(window) {
                    log::error!("Toolkit: destroying {window:?} on shutdown failed: {err}");
                }
            }
            if let Some(token) = registration.class_token() {
                if let Err(err) = self.platform.unregister_class(token) {
                    log::error!("Toolkit: unregistering class {token:?} on shutdown failed: {err}");
                }
            }
        }
        let leftover = self.deferred.run_pending();
        log::debug!("Toolkit: shut down ({leftover} deferred task(s) flushed).");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform_headless::HeadlessPlatform;
    use crate::types::{Point, PointerEventKind};
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const USER_MESSAGE: WindowMessage = WindowMessage::Other {
        msg: 0x0400,
        wparam: 0,
        lparam: 0,
    };

    fn setup() -> (Arc<HeadlessPlatform>, Toolkit) {
        let platform = Arc::new(HeadlessPlatform::new());
        let toolkit = Toolkit::new(platform.clone(), ToolkitConfig::default()).unwrap();
        (platform, toolkit)
    }

    fn params(name: &str) -> WindowParams {
        WindowParams {
            parent: None,
            bounds: Default::default(),
            style: Default::default(),
            name: name.to_string(),
        }
    }

    type Journal = Rc<RefCell<Vec<(WindowHandle, &'static str)>>>;

    /*
     * Records every message it sees. On `Destroyed` it also snapshots how many
     * window classes are still registered, to check class release ordering.
     */
    struct RecordingController {
        journal: Journal,
        platform: Arc<HeadlessPlatform>,
        classes_at_destroyed: Rc<Cell<Option<usize>>>,
        abort_creation: bool,
        panic_on_other: bool,
        dropped: Rc<Cell<bool>>,
    }

    impl RecordingController {
        fn new(platform: &Arc<HeadlessPlatform>) -> Self {
            Self {
                journal: Rc::new(RefCell::new(Vec::new())),
                platform: Arc::clone(platform),
                classes_at_destroyed: Rc::new(Cell::new(None)),
                abort_creation: false,
                panic_on_other: false,
                dropped: Rc::new(Cell::new(false)),
            }
        }
    }

    impl WindowController for RecordingController {
        fn class_name_suffix(&self) -> &str {
            "Recording"
        }

        fn handle_message(&self, window: WindowHandle, message: WindowMessage) -> MessageResult {
            self.journal.borrow_mut().push((window, message.name()));
            match message {
                WindowMessage::Created if self.abort_creation => Some(-1),
                WindowMessage::Other { .. } if self.panic_on_other => panic!("handler failed"),
                WindowMessage::Destroyed => {
                    self.classes_at_destroyed
                        .set(Some(self.platform.registered_class_count()));
                    Some(0)
                }
                _ => None,
            }
        }
    }

    impl Drop for RecordingController {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    #[test]
    fn new_toolkit_activates_dispatcher_through_coordination_window() {
        let (platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        assert!(dispatcher.is_active());
        assert!(dispatcher.is_bound_thread());
        let window = toolkit.coordination_window().unwrap();
        assert!(toolkit.lookup(window).is_some());
        assert_eq!(platform.window_count(), 1);
    }

    #[test]
    fn submit_and_wait_from_another_thread_is_complete_on_return() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));

        let remote_counter = Arc::clone(&counter);
        let remote = thread::spawn(move || {
            let work_counter = Arc::clone(&remote_counter);
            let returned = dispatcher.submit_and_wait(move || {
                work_counter.fetch_add(1, Ordering::SeqCst);
                "ran"
            });
            let observed = remote_counter.load(Ordering::SeqCst);
            dispatcher.leave_nested_loop(None);
            (returned, observed)
        });

        assert!(toolkit.enter_nested_loop().is_none());
        let (returned, observed) = remote.join().unwrap();
        assert_eq!(returned, Some("ran"));
        assert_eq!(observed, 1);
    }

    #[test]
    fn submit_and_wait_on_bound_thread_runs_inline() {
        let (_platform, toolkit) = setup();
        let result = toolkit.dispatcher().submit_and_wait(|| 6 * 7);
        assert_eq!(result, Some(42));
    }

    #[test]
    fn leave_from_another_thread_returns_its_value() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        let remote = thread::spawn(move || {
            // Runs inside the loop, so the loop is known to be active afterwards.
            dispatcher.submit_and_wait(|| ());
            dispatcher.leave_nested_loop(Some(Box::new(42_i32)));
        });

        let value = toolkit.enter_nested_loop().unwrap();
        remote.join().unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&42));
        assert_eq!(toolkit.nested_loop_depth(), 0);
    }

    #[test]
    fn leave_from_action_on_bound_thread_round_trips_value() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        let leaver = dispatcher.clone();
        dispatcher.submit_deferred(move || leaver.leave_nested_loop(Some(Box::new("done"))));

        let value = toolkit.enter_nested_loop().unwrap();
        assert_eq!(value.downcast_ref::<&str>(), Some(&"done"));
    }

    #[test]
    fn nested_loops_stop_innermost_first() {
        let (_platform, toolkit) = setup();
        let inner_value = Rc::new(Cell::new(None));
        let depth_inside = Rc::new(Cell::new(0));

        let nested_toolkit = toolkit.clone();
        let recorded_value = Rc::clone(&inner_value);
        let recorded_depth = Rc::clone(&depth_inside);
        toolkit.defer(move || {
            let dispatcher = nested_toolkit.dispatcher();
            let leaver = dispatcher.clone();
            dispatcher.submit_deferred(move || {
                leaver.leave_nested_loop(Some(Box::new(1_i32)));
            });
            recorded_depth.set(nested_toolkit.nested_loop_depth());
            let value = nested_toolkit
                .enter_nested_loop()
                .and_then(|value| value.downcast_ref::<i32>().copied());
            recorded_value.set(value);
            nested_toolkit.leave_nested_loop(Some(Box::new(2_i32)));
        });

        let outer = toolkit.enter_nested_loop().unwrap();
        assert_eq!(depth_inside.get(), 1);
        assert_eq!(inner_value.get(), Some(1));
        assert_eq!(outer.downcast_ref::<i32>(), Some(&2));
    }

    #[test]
    fn stale_leave_request_is_absorbed_at_loop_entry() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        dispatcher.leave_nested_loop(Some(Box::new(99_i32)));

        let leaver = dispatcher.clone();
        dispatcher.submit_deferred(move || leaver.leave_nested_loop(None));
        assert!(toolkit.enter_nested_loop().is_none());
    }

    #[test]
    fn loop_ends_when_dispatcher_disappears() {
        let (platform, toolkit) = setup();
        let terminating = toolkit.clone();
        toolkit.defer(move || terminating.terminate_loop().unwrap());

        assert!(toolkit.enter_nested_loop().is_none());
        assert!(!toolkit.dispatcher().is_active());
        assert_eq!(platform.window_count(), 0);

        let payload = Arc::new(());
        let captured = Arc::clone(&payload);
        toolkit.dispatcher().submit_deferred(move || drop(captured));
        assert_eq!(Arc::strong_count(&payload), 1);
        assert!(toolkit.dispatcher().submit_and_wait(|| 1).is_none());
    }

    #[test]
    fn queue_shutdown_ends_nested_loop_and_is_passed_outwards() {
        let (platform, toolkit) = setup();
        platform.post_quit(4);
        assert!(toolkit.enter_nested_loop().is_none());
        assert_eq!(platform.pump_one(false), PumpOutcome::Quit(4));
    }

    #[test]
    fn run_loop_executes_launch_then_pumps_until_quit() {
        let (platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        let launched = Rc::new(Cell::new(false));

        let remote_counter = Arc::clone(&counter);
        let remote_platform = Arc::clone(&platform);
        let launched_flag = Rc::clone(&launched);
        let mut remote = None;
        toolkit.run_loop(|| {
            launched_flag.set(true);
            remote = Some(thread::spawn(move || {
                dispatcher.submit_and_wait(move || {
                    remote_counter.fetch_add(1, Ordering::SeqCst);
                });
                remote_platform.post_quit(0);
            }));
        });

        if let Some(remote) = remote {
            remote.join().unwrap();
        }
        assert!(launched.get());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn created_window_is_registered_before_its_handler_runs() {
        let (platform, toolkit) = setup();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let window = toolkit
            .create_window(recorder, &params("main"), None)
            .unwrap();

        assert!(toolkit.lookup(window).is_some());
        assert_eq!(journal.borrow().first(), Some(&(window, "Created")));
        assert_eq!(toolkit.window_count(), 2);
    }

    #[test]
    fn destroy_releases_controller_and_defers_class_release() {
        let (platform, toolkit) = setup();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let dropped = Rc::clone(&recorder.dropped);
        let classes_at_destroyed = Rc::clone(&recorder.classes_at_destroyed);
        let window = toolkit
            .create_window(recorder, &params("doomed"), None)
            .unwrap();
        assert_eq!(platform.registered_class_count(), 2);
        let held = toolkit.lookup(window).unwrap();
        assert!(held.upgrade().is_some());

        toolkit.destroy_window(window).unwrap();
        assert!(toolkit.lookup(window).is_none());
        assert!(dropped.get());
        assert!(held.upgrade().is_none());
        assert_eq!(classes_at_destroyed.get(), Some(2));
        assert_eq!(platform.registered_class_count(), 2);
        assert_eq!(toolkit.pending_deferred_tasks(), 1);
        let names: Vec<&str> = journal.borrow().iter().map(|(_, name)| *name).collect();
        assert_eq!(names, vec!["Created", "Destroying", "Destroyed"]);

        toolkit.pump_pending();
        assert_eq!(platform.registered_class_count(), 1);
        assert!(toolkit.destroy_window(window).is_err());
    }

    #[test]
    fn failed_creation_leaves_no_registration() {
        let (platform, toolkit) = setup();
        let mut recorder = RecordingController::new(&platform);
        recorder.abort_creation = true;
        let dropped = Rc::clone(&recorder.dropped);
        let result = toolkit.create_window(recorder, &params("aborted"), None);

        assert!(matches!(result, Err(PlatformError::CreationFailed(_))));
        assert!(dropped.get());
        assert_eq!(toolkit.window_count(), 1);
        toolkit.pump_pending();
        assert_eq!(platform.registered_class_count(), 1);

        platform.simulate_window_creation_failure();
        let result = toolkit.create_window(
            RecordingController::new(&platform),
            &params("refused"),
            None,
        );
        assert!(matches!(result, Err(PlatformError::CreationFailed(_))));
        assert_eq!(platform.registered_class_count(), 1);
    }

    #[test]
    fn messages_for_unknown_windows_fall_back_to_default_handling() {
        let (_platform, toolkit) = setup();
        let result = toolkit
            .inner
            .window_proc(WindowHandle(0xDEAD), WindowMessage::Wake);
        assert_eq!(result, None);
    }

    #[test]
    fn cursor_is_applied_on_set_and_on_client_area_set_cursor() {
        let (platform, toolkit) = setup();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let window = toolkit
            .create_window(recorder, &params("cursor"), None)
            .unwrap();

        toolkit.set_cursor(window, CursorHandle(77)).unwrap();
        assert_eq!(platform.current_cursor(), CursorHandle(77));

        platform.apply_cursor(CursorHandle(1));
        let handled = platform
            .send_message(window, WindowMessage::SetCursor { client_area: true })
            .unwrap();
        assert_eq!(handled, Some(CURSOR_HANDLED));
        assert_eq!(platform.current_cursor(), CursorHandle(77));

        let unhandled = platform
            .send_message(window, WindowMessage::SetCursor { client_area: false })
            .unwrap();
        assert_eq!(unhandled, None);
        assert_eq!(journal.borrow().last(), Some(&(window, "SetCursor")));
    }

    #[test]
    fn ancestor_is_kept_with_the_registration() {
        let (platform, toolkit) = setup();
        let owner = toolkit
            .create_window(RecordingController::new(&platform), &params("owner"), None)
            .unwrap();
        let dialog = toolkit
            .create_window(
                RecordingController::new(&platform),
                &params("dialog"),
                Some(owner),
            )
            .unwrap();
        assert_eq!(toolkit.ancestor(dialog), Some(owner));
        assert_eq!(toolkit.ancestor(owner), None);
    }

    #[test]
    fn pointer_hook_resets_grab_only_for_foreign_presses() {
        let (platform, toolkit) = setup();
        let resets = Rc::new(Cell::new(0));
        let reset_counter = Rc::clone(&resets);
        toolkit.set_grab_reset(move || reset_counter.set(reset_counter.get() + 1));

        let owned = toolkit
            .create_window(RecordingController::new(&platform), &params("owned"), None)
            .unwrap();
        let child = toolkit
            .create_window(
                RecordingController::new(&platform),
                &WindowParams {
                    parent: Some(owned),
                    ..params("child")
                },
                None,
            )
            .unwrap();
        let inside = Point { x: 10, y: 10 };
        let outside = Point { x: 900, y: 900 };
        platform.simulate_window_at(inside, child);

        toolkit.acquire_pointer_hook().unwrap();
        for (kind, point) in [
            (PointerEventKind::LeftDown, inside),
            (PointerEventKind::RightDown, outside),
            (PointerEventKind::Move, outside),
        ] {
            assert!(platform.simulate_pointer_event(PointerHookEvent { kind, point }));
        }
        toolkit.pump_pending();

        assert_eq!(resets.get(), 1);
        assert_eq!(platform.forwarded_pointer_events(), 3);
        toolkit.release_pointer_hook();
        assert!(!platform.hook_installed());
    }

    #[test]
    fn shared_hook_survives_until_last_release() {
        let (platform, toolkit) = setup();
        toolkit.acquire_pointer_hook().unwrap();
        toolkit.acquire_pointer_hook().unwrap();
        toolkit.release_pointer_hook();
        assert!(platform.hook_installed());
        assert_eq!(toolkit.pointer_hook_requests(), 1);
        toolkit.release_pointer_hook();
        assert!(!platform.hook_installed());
        assert_eq!(platform.hook_install_count(), 1);
    }

    #[test]
    fn deferred_work_from_many_threads_runs_exactly_once() {
        let (_platform, toolkit) = setup();
        let executed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = toolkit.dispatcher();
                let executed = Arc::clone(&executed);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let executed = Arc::clone(&executed);
                        dispatcher.submit_deferred(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                    // Posted after this thread's deferred work, so it runs after all of it.
                    dispatcher.submit_and_wait(|| ());
                })
            })
            .collect();

        let dispatcher = toolkit.dispatcher();
        let finisher = thread::spawn(move || {
            for worker in workers {
                worker.join().unwrap();
            }
            dispatcher.leave_nested_loop(None);
        });

        toolkit.enter_nested_loop();
        finisher.join().unwrap();
        toolkit.pump_pending();
        assert_eq!(executed.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn deferred_work_racing_teardown_is_run_or_released() {
        let (platform, toolkit) = setup();
        let token = Arc::new(());
        let executed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = toolkit.dispatcher();
                let token = Arc::clone(&token);
                let executed = Arc::clone(&executed);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let token = Arc::clone(&token);
                        let executed = Arc::clone(&executed);
                        dispatcher.submit_deferred(move || {
                            let _held = token;
                            executed.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for _ in 0..10 {
            toolkit.pump_pending();
            thread::yield_now();
        }
        toolkit.terminate_loop().unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        toolkit.pump_pending();

        assert!(executed.load(Ordering::SeqCst) <= 400);
        assert_eq!(platform.queued_message_count(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn dropping_toolkit_tears_everything_down() {
        let platform = Arc::new(HeadlessPlatform::new());
        let dispatcher = {
            let toolkit = Toolkit::new(platform.clone(), ToolkitConfig::default()).unwrap();
            toolkit
                .create_window(RecordingController::new(&platform), &params("left open"), None)
                .unwrap();
            toolkit.acquire_pointer_hook().unwrap();
            toolkit.register_clipboard_viewer(|| {}).unwrap();
            toolkit.dispatcher()
        };
        assert!(!dispatcher.is_active());
        assert_eq!(platform.window_count(), 0);
        assert_eq!(platform.registered_class_count(), 0);
        assert!(!platform.hook_installed());
        assert!(platform.clipboard_viewers().is_empty());
    }

    #[test]
    fn second_toolkit_on_the_same_thread_is_refused() {
        let (platform, toolkit) = setup();
        let second = Toolkit::new(platform.clone(), ToolkitConfig::default());
        assert!(matches!(second, Err(PlatformError::InitializationFailed(_))));
        assert_eq!(platform.window_count(), 1);

        let window = toolkit
            .create_window(RecordingController::new(&platform), &params("still served"), None)
            .unwrap();
        assert!(toolkit.lookup(window).is_some());
        let handled = platform
            .send_message(window, WindowMessage::SetCursor { client_area: true })
            .unwrap();
        assert_eq!(handled, Some(CURSOR_HANDLED));
        assert_eq!(toolkit.dispatcher().submit_and_wait(|| 3), Some(3));
    }

    #[test]
    fn panicking_deferred_action_does_not_end_the_loop() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        dispatcher.submit_deferred(|| panic!("deferred work failed"));
        let leaver = dispatcher.clone();
        dispatcher.submit_deferred(move || leaver.leave_nested_loop(Some(Box::new(5_i32))));

        let value = toolkit.enter_nested_loop().unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&5));
        assert_eq!(toolkit.nested_loop_depth(), 0);
        assert!(dispatcher.is_active());
    }

    #[test]
    fn panicking_synchronous_action_gives_the_submitter_no_result() {
        let (_platform, toolkit) = setup();
        let dispatcher = toolkit.dispatcher();
        let remote = thread::spawn(move || {
            let result: Option<i32> =
                dispatcher.submit_and_wait(|| panic!("synchronous work failed"));
            dispatcher.leave_nested_loop(Some(Box::new(result.is_none())));
        });

        let value = toolkit.enter_nested_loop().unwrap();
        remote.join().unwrap();
        assert_eq!(value.downcast_ref::<bool>(), Some(&true));
    }

    #[test]
    fn panicking_window_handler_unwinds_with_loop_state_restored() {
        let (platform, toolkit) = setup();
        let mut recorder = RecordingController::new(&platform);
        recorder.panic_on_other = true;
        let window = toolkit
            .create_window(recorder, &params("fragile"), None)
            .unwrap();
        platform.post_message(window, USER_MESSAGE).unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| toolkit.enter_nested_loop()));
        assert!(outcome.is_err());
        assert_eq!(toolkit.nested_loop_depth(), 0);

        let dispatcher = toolkit.dispatcher();
        let leaver = dispatcher.clone();
        dispatcher.submit_deferred(move || leaver.leave_nested_loop(Some(Box::new(8_i32))));
        let value = toolkit.enter_nested_loop().unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&8));
    }

    #[test]
    fn run_loop_serves_one_more_event_for_accessibility_clients() {
        let platform = Arc::new(HeadlessPlatform::new());
        let config =
            ToolkitConfig::default().with_accessibility_settle_timeout(Duration::from_millis(50));
        let toolkit = Toolkit::new(platform.clone(), config).unwrap();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let window = toolkit
            .create_window(recorder, &params("accessible"), None)
            .unwrap();
        assert_eq!(toolkit.dispatcher().increment_accessibility(), 1);

        toolkit.run_loop(|| {
            platform.post_message(window, USER_MESSAGE).unwrap();
            toolkit.terminate_loop().unwrap();
        });

        assert_eq!(journal.borrow().last(), Some(&(window, "Other")));
        assert_eq!(platform.queued_message_count(), 0);
    }

    #[test]
    fn run_loop_stops_at_once_without_accessibility_clients() {
        let (platform, toolkit) = setup();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let window = toolkit
            .create_window(recorder, &params("plain"), None)
            .unwrap();

        toolkit.run_loop(|| {
            platform.post_message(window, USER_MESSAGE).unwrap();
            toolkit.terminate_loop().unwrap();
        });

        assert_eq!(journal.borrow().last(), Some(&(window, "Created")));
        assert_eq!(platform.queued_message_count(), 1);
    }

    #[test]
    fn system_notifications_reach_the_handler() {
        let (platform, toolkit) = setup();
        let coordination = toolkit.coordination_window().unwrap();
        let notify = |notification| {
            platform
                .send_message(coordination, WindowMessage::System(notification))
                .unwrap()
        };
        assert_eq!(notify(SystemNotification::ThemeChanged), None);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let handled = Rc::new(Cell::new(true));
        let recorded = Rc::clone(&seen);
        let answer = Rc::clone(&handled);
        toolkit.set_system_notification_handler(move |notification| {
            recorded.borrow_mut().push(notification);
            answer.get()
        });

        assert_eq!(notify(SystemNotification::ThemeChanged), Some(0));
        handled.set(false);
        assert_eq!(notify(SystemNotification::ThemeChanged), Some(1));
        assert_eq!(notify(SystemNotification::WorkAreaChanged), None);
        assert_eq!(notify(SystemNotification::DisplayChanged), None);
        assert_eq!(
            *seen.borrow(),
            vec![
                SystemNotification::ThemeChanged,
                SystemNotification::ThemeChanged,
                SystemNotification::WorkAreaChanged,
                SystemNotification::DisplayChanged,
            ]
        );
    }

    #[test]
    fn clipboard_viewer_notifies_listener_and_keeps_the_chain_linked() {
        let (platform, toolkit) = setup();
        let recorder = RecordingController::new(&platform);
        let journal = Rc::clone(&recorder.journal);
        let earlier = toolkit
            .create_window(recorder, &params("earlier viewer"), None)
            .unwrap();
        platform.set_clipboard_viewer(earlier).unwrap();

        let changes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&changes);
        toolkit
            .register_clipboard_viewer(move || counter.set(counter.get() + 1))
            .unwrap();
        assert!(toolkit.is_clipboard_viewer());
        let coordination = toolkit.coordination_window().unwrap();
        assert_eq!(platform.clipboard_viewers(), vec![coordination, earlier]);

        assert!(platform.simulate_clipboard_change());
        assert_eq!(changes.get(), 1);
        assert_eq!(journal.borrow().last(), Some(&(earlier, "ClipboardChanged")));

        // A removal further down the chain is passed on to the next viewer.
        let unrelated = WindowMessage::ClipboardChainChanged {
            removed: WindowHandle(0x7777),
            next: None,
        };
        platform.send_message(coordination, unrelated).unwrap();
        assert_eq!(journal.borrow().last(), Some(&(earlier, "ClipboardChainChanged")));

        // Removing the next viewer relinks instead of forwarding.
        platform.change_clipboard_chain(earlier, None).unwrap();
        let seen_by_earlier = journal.borrow().len();
        assert!(platform.simulate_clipboard_change());
        assert_eq!(changes.get(), 2);
        assert_eq!(journal.borrow().len(), seen_by_earlier);

        toolkit.terminate_loop().unwrap();
        assert!(platform.clipboard_viewers().is_empty());
        assert!(!toolkit.is_clipboard_viewer());
    }

    #[test]
    fn unregistered_clipboard_viewer_hears_nothing() {
        let (platform, toolkit) = setup();
        let changes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&changes);
        toolkit
            .register_clipboard_viewer(move || counter.set(counter.get() + 1))
            .unwrap();
        toolkit.unregister_clipboard_viewer().unwrap();

        assert!(platform.clipboard_viewers().is_empty());
        assert!(!platform.simulate_clipboard_change());
        assert_eq!(changes.get(), 0);
        assert!(toolkit.unregister_clipboard_viewer().is_ok());
    }
}

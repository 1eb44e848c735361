/*
 * Controller of the coordination window, the hidden window behind the
 * dispatcher. Besides running dispatched actions and tracking the dispatcher
 * instance, it is where system-wide notifications arrive, and it is the
 * window that joins the clipboard-viewer chain on the toolkit's behalf.
 *
 * The collaborators for those notifications are installed through `Toolkit`
 * and reach the controller through the shared `CoordinationState`.
 */

use crate::action::panic_message;
use crate::dispatcher::Dispatcher;
use crate::error::Result as PlatformResult;
use crate::platform::Platform;
use crate::registry::WindowController;
use crate::types::{MessageResult, SystemNotification, WindowHandle, WindowMessage};

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

// Answers to a theme change: zero when the handler took care of it.
const THEME_HANDLED: isize = 0;
const THEME_UNHANDLED: isize = 1;

pub(crate) type SystemHandler = Rc<dyn Fn(SystemNotification) -> bool>;
pub(crate) type ClipboardListener = Rc<dyn Fn()>;

#[derive(Default)]
pub(crate) struct CoordinationState {
    system_handler: RefCell<Option<SystemHandler>>,
    clipboard_listener: RefCell<Option<ClipboardListener>>,
    clipboard_member: Cell<bool>,
    next_clipboard_viewer: Cell<Option<WindowHandle>>,
}

impl CoordinationState {
    pub(crate) fn set_system_handler(&self, handler: SystemHandler) {
        *self.system_handler.borrow_mut() = Some(handler);
    }

    pub(crate) fn is_clipboard_viewer(&self) -> bool {
        self.clipboard_member.get()
    }

    /// Joins the chain with `window`, or only swaps the listener when already a member.
    pub(crate) fn join_clipboard_chain(
        &self,
        platform: &dyn Platform,
        window: WindowHandle,
        listener: ClipboardListener,
    ) -> PlatformResult<()> {
        if !self.clipboard_member.get() {
            let next = platform.set_clipboard_viewer(window)?;
            self.next_clipboard_viewer.set(next);
            self.clipboard_member.set(true);
            log::debug!("Coordination: {window:?} joined the clipboard chain ahead of {next:?}.");
        }
        *self.clipboard_listener.borrow_mut() = Some(listener);
        Ok(())
    }

    pub(crate) fn leave_clipboard_chain(
        &self,
        platform: &dyn Platform,
        window: WindowHandle,
    ) -> PlatformResult<()> {
        self.clipboard_listener.borrow_mut().take();
        if !self.clipboard_member.replace(false) {
            return Ok(());
        }
        let next = self.next_clipboard_viewer.take();
        log::debug!("Coordination: {window:?} leaving the clipboard chain.");
        platform.change_clipboard_chain(window, next)
    }

    fn notify_system(&self, notification: SystemNotification) -> MessageResult {
        let handler = self.system_handler.borrow().clone();
        let handler = handler?;
        let handled = match panic::catch_unwind(AssertUnwindSafe(|| handler(notification))) {
            Ok(handled) => handled,
            Err(payload) => {
                log::error!(
                    "Coordination: {notification:?} handler panicked: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        };
        match notification {
            SystemNotification::ThemeChanged if handled => Some(THEME_HANDLED),
            SystemNotification::ThemeChanged => Some(THEME_UNHANDLED),
            SystemNotification::WorkAreaChanged | SystemNotification::DisplayChanged => None,
        }
    }

    fn relink_clipboard_chain(
        &self,
        platform: &dyn Platform,
        removed: WindowHandle,
        next: Option<WindowHandle>,
    ) {
        match self.next_clipboard_viewer.get() {
            Some(current) if current == removed => self.next_clipboard_viewer.set(next),
            Some(current) => forward(
                platform,
                current,
                WindowMessage::ClipboardChainChanged { removed, next },
            ),
            None => {}
        }
    }

    fn clipboard_changed(&self, platform: &dyn Platform) {
        let listener = self.clipboard_listener.borrow().clone();
        if let Some(listener) = listener {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener())) {
                log::error!(
                    "Coordination: clipboard listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        if let Some(next) = self.next_clipboard_viewer.get() {
            forward(platform, next, WindowMessage::ClipboardChanged);
        }
    }
}

fn forward(platform: &dyn Platform, target: WindowHandle, message: WindowMessage) {
    if let Err(message) = platform.send_message(target, message) {
        log::debug!(
            "Coordination: clipboard viewer {target:?} gone; {} not passed on.",
            message.name()
        );
    }
}

pub(crate) struct CoordinationWindow {
    dispatcher: Dispatcher,
    class_suffix: String,
    state: Rc<CoordinationState>,
}

impl CoordinationWindow {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        class_suffix: String,
        state: Rc<CoordinationState>,
    ) -> Self {
        Self {
            dispatcher,
            class_suffix,
            state,
        }
    }
}

impl WindowController for CoordinationWindow {
    fn class_name_suffix(&self) -> &str {
        &self.class_suffix
    }

    fn handle_message(&self, window: WindowHandle, message: WindowMessage) -> MessageResult {
        let platform = self.dispatcher.platform().as_ref();
        match message {
            WindowMessage::Created => {
                self.dispatcher.attach(window);
                None
            }
            WindowMessage::RunAction(action) | WindowMessage::RunActionLater(action) => {
                action.run();
                Some(0)
            }
            WindowMessage::Wake => Some(0),
            WindowMessage::System(notification) => self.state.notify_system(notification),
            WindowMessage::ClipboardChainChanged { removed, next } => {
                self.state.relink_clipboard_chain(platform, removed, next);
                None
            }
            WindowMessage::ClipboardChanged => {
                self.state.clipboard_changed(platform);
                None
            }
            WindowMessage::Destroying => {
                if let Err(err) = self.state.leave_clipboard_chain(platform, window) {
                    log::error!("Coordination: leaving the clipboard chain failed: {err}");
                }
                None
            }
            WindowMessage::Destroyed => {
                self.dispatcher.detach(window);
                Some(0)
            }
            _ => None,
        }
    }
}

/*
 * In-process implementation of `Platform` with the same delivery rules as the
 * Win32 backend, so the coordination logic behaves identically on hosts with
 * no native windowing and under test:
 *
 * - a message sent from another thread blocks its sender until the bound
 *   thread's pump has delivered it; a send from the bound thread is
 *   delivered inline;
 * - sent messages are served before posted ones, each queue in FIFO order,
 *   and a quit request is only reported once both queues are empty;
 * - creation and destruction notifications are delivered synchronously, and
 *   a window class stays in use until its last window has received
 *   `Destroyed`;
 * - posted messages still queued for a window are released when it dies;
 * - the clipboard-viewer chain is a stack whose top receives the change
 *   notifications, which each viewer is expected to pass on.
 *
 * The `simulate_*` and inspection methods let callers drive the parts the OS
 * would normally own (pointer input, hit testing, clipboard changes,
 * failures).
 */

use crate::error::{PlatformError, Result as PlatformResult};
use crate::platform::{
    Platform, PumpOutcome, WindowProc, bind_thread_window_proc, thread_window_proc,
    unbind_thread_window_proc,
};
use crate::types::{
    ClassDescriptor, ClassToken, CursorHandle, HookHandle, MessageResult, Point,
    PointerHookEvent, WindowHandle, WindowMessage, WindowParams,
};

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::rc::Weak;
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const DEFAULT_CURSOR: CursorHandle = CursorHandle(0x10003);
const FIRST_WINDOW_HANDLE: isize = 0x1000;
const FIRST_CLASS_ATOM: u16 = 0xC000;
const CREATE_ABORTED: isize = -1;

type SendReply = Result<MessageResult, WindowMessage>;

struct SentMessage {
    target: WindowHandle,
    message: WindowMessage,
    reply: mpsc::SyncSender<SendReply>,
}

enum Posted {
    Message {
        target: WindowHandle,
        message: WindowMessage,
    },
    Pointer(PointerHookEvent),
}

#[derive(Debug)]
struct HeadlessWindow {
    class: ClassToken,
    parent: Option<WindowHandle>,
}

struct HeadlessState {
    bound_thread: Option<ThreadId>,
    next_window: isize,
    next_atom: u16,
    next_hook: isize,
    classes: HashMap<ClassToken, String>,
    windows: HashMap<WindowHandle, HeadlessWindow>,
    hit_test: HashMap<Point, WindowHandle>,
    sent: VecDeque<SentMessage>,
    posted: VecDeque<Posted>,
    quit_code: Option<i32>,
    hook: Option<HookHandle>,
    hook_installs: usize,
    hook_removals: usize,
    forwarded_pointer_events: usize,
    cursor: CursorHandle,
    clipboard_viewers: Vec<WindowHandle>,
    fail_next_class_registration: bool,
    fail_next_window_creation: bool,
    fail_next_hook_install: bool,
}

impl HeadlessState {
    fn new() -> Self {
        Self {
            bound_thread: None,
            next_window: FIRST_WINDOW_HANDLE,
            next_atom: FIRST_CLASS_ATOM,
            next_hook: 1,
            classes: HashMap::new(),
            windows: HashMap::new(),
            hit_test: HashMap::new(),
            sent: VecDeque::new(),
            posted: VecDeque::new(),
            quit_code: None,
            hook: None,
            hook_installs: 0,
            hook_removals: 0,
            forwarded_pointer_events: 0,
            cursor: DEFAULT_CURSOR,
            clipboard_viewers: Vec::new(),
            fail_next_class_registration: false,
            fail_next_window_creation: false,
            fail_next_hook_install: false,
        }
    }
}

pub struct HeadlessPlatform {
    state: Mutex<HeadlessState>,
    wakeup: Condvar,
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeadlessState::new()),
            wakeup: Condvar::new(),
        }
    }

    fn is_bound_thread(&self) -> bool {
        self.state.lock().bound_thread == Some(thread::current().id())
    }

    fn deliver(&self, target: WindowHandle, message: WindowMessage) -> SendReply {
        if !self.is_window(target) {
            return Err(message);
        }
        match thread_window_proc() {
            Some(window_proc) => Ok(window_proc.window_proc(target, message)),
            None => {
                log::warn!("Headless: no window procedure bound; dropping {}.", message.name());
                Ok(None)
            }
        }
    }

    fn deliver_pointer_event(&self, event: PointerHookEvent) {
        if let Some(window_proc) = thread_window_proc() {
            window_proc.pointer_hook(&event);
        }
        self.state.lock().forwarded_pointer_events += 1;
    }

    /// Queues a global pointer event. Returns false when no hook is installed to observe it.
    pub fn simulate_pointer_event(&self, event: PointerHookEvent) -> bool {
        let mut state = self.state.lock();
        if state.hook.is_none() {
            return false;
        }
        state.posted.push_back(Posted::Pointer(event));
        self.wakeup.notify_all();
        true
    }

    /// Notifies the first clipboard viewer, on the calling thread, that the contents changed.
    /// Returns false with no viewer.
    pub fn simulate_clipboard_change(&self) -> bool {
        let first = self.state.lock().clipboard_viewers.last().copied();
        match first {
            Some(viewer) => self.deliver(viewer, WindowMessage::ClipboardChanged).is_ok(),
            None => false,
        }
    }

    /// Makes `window_from_point` report `window` for `point`.
    pub fn simulate_window_at(&self, point: Point, window: WindowHandle) {
        self.state.lock().hit_test.insert(point, window);
    }

    pub fn simulate_class_registration_failure(&self) {
        self.state.lock().fail_next_class_registration = true;
    }

    pub fn simulate_window_creation_failure(&self) {
        self.state.lock().fail_next_window_creation = true;
    }

    pub fn simulate_hook_install_failure(&self) {
        self.state.lock().fail_next_hook_install = true;
    }

    pub fn hook_installed(&self) -> bool {
        self.state.lock().hook.is_some()
    }

    pub fn hook_install_count(&self) -> usize {
        self.state.lock().hook_installs
    }

    pub fn hook_removal_count(&self) -> usize {
        self.state.lock().hook_removals
    }

    pub fn forwarded_pointer_events(&self) -> usize {
        self.state.lock().forwarded_pointer_events
    }

    pub fn current_cursor(&self) -> CursorHandle {
        self.state.lock().cursor
    }

    pub fn class_registered(&self, token: ClassToken) -> bool {
        self.state.lock().classes.contains_key(&token)
    }

    pub fn registered_class_count(&self) -> usize {
        self.state.lock().classes.len()
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Clipboard viewers from last joined to first joined.
    pub fn clipboard_viewers(&self) -> Vec<WindowHandle> {
        self.state.lock().clipboard_viewers.iter().rev().copied().collect()
    }

    pub fn queued_message_count(&self) -> usize {
        let state = self.state.lock();
        state.sent.len() + state.posted.len()
    }

    // Sent messages first, then posted ones, then a pending quit.
    fn pump_until(&self, wait: bool, deadline: Option<Instant>) -> PumpOutcome {
        let mut state = self.state.lock();
        loop {
            if let Some(sent) = state.sent.pop_front() {
                drop(state);
                let reply = self.deliver(sent.target, sent.message);
                let _ = sent.reply.send(reply);
                return PumpOutcome::Dispatched;
            }
            if let Some(posted) = state.posted.pop_front() {
                drop(state);
                match posted {
                    Posted::Message { target, message } => {
                        if let Err(message) = self.deliver(target, message) {
                            log::debug!(
                                "Headless: dropping {} posted to dead window {target:?}.",
                                message.name()
                            );
                        }
                    }
                    Posted::Pointer(event) => self.deliver_pointer_event(event),
                }
                return PumpOutcome::Dispatched;
            }
            if let Some(exit_code) = state.quit_code.take() {
                return PumpOutcome::Quit(exit_code);
            }
            if !wait {
                return PumpOutcome::Idle;
            }
            match deadline {
                None => self.wakeup.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => return PumpOutcome::Idle,
                Some(deadline) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn children_of(&self, window: WindowHandle) -> Vec<WindowHandle> {
        let state = self.state.lock();
        let mut children: Vec<WindowHandle> = state
            .windows
            .iter()
            .filter(|(_, data)| data.parent == Some(window))
            .map(|(handle, _)| *handle)
            .collect();
        children.sort();
        children
    }
}

impl Platform for HeadlessPlatform {
    fn bind_window_proc(&self, window_proc: Weak<dyn WindowProc>) -> PlatformResult<()> {
        bind_thread_window_proc(window_proc)?;
        self.state.lock().bound_thread = Some(thread::current().id());
        Ok(())
    }

    fn unbind_window_proc(&self) {
        unbind_thread_window_proc();
        let mut state = self.state.lock();
        if state.bound_thread == Some(thread::current().id()) {
            state.bound_thread = None;
        }
    }

    fn register_class(&self, class: &ClassDescriptor) -> PlatformResult<ClassToken> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_class_registration) {
            return Err(PlatformError::CreationFailed(format!(
                "class registration for '{}' refused",
                class.name
            )));
        }
        if state.classes.values().any(|name| *name == class.name) {
            return Err(PlatformError::CreationFailed(format!(
                "class '{}' already registered",
                class.name
            )));
        }
        let token = ClassToken(state.next_atom);
        state.next_atom = state.next_atom.wrapping_add(1);
        state.classes.insert(token, class.name.clone());
        Ok(token)
    }

    fn unregister_class(&self, token: ClassToken) -> PlatformResult<()> {
        let mut state = self.state.lock();
        if state.windows.values().any(|window| window.class == token) {
            return Err(PlatformError::OperationFailed(format!(
                "class {token:?} still has live windows"
            )));
        }
        state
            .classes
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| PlatformError::InvalidHandle(format!("class {token:?} not registered")))
    }

    fn create_window(
        &self,
        class: ClassToken,
        params: &WindowParams,
    ) -> PlatformResult<WindowHandle> {
        let handle = {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_window_creation) {
                return Err(PlatformError::CreationFailed(format!(
                    "creation of '{}' refused",
                    params.name
                )));
            }
            if !state.classes.contains_key(&class) {
                return Err(PlatformError::CreationFailed(format!(
                    "class {class:?} not registered"
                )));
            }
            if let Some(parent) = params.parent {
                if !state.windows.contains_key(&parent) {
                    return Err(PlatformError::CreationFailed(format!(
                        "parent {parent:?} does not exist"
                    )));
                }
            }
            let handle = WindowHandle(state.next_window);
            state.next_window += 1;
            state.windows.insert(
                handle,
                HeadlessWindow {
                    class,
                    parent: params.parent,
                },
            );
            handle
        };

        if let Ok(Some(CREATE_ABORTED)) = self.deliver(handle, WindowMessage::Created) {
            self.destroy_window(handle)?;
            return Err(PlatformError::CreationFailed(format!(
                "window '{}' aborted its own creation",
                params.name
            )));
        }
        Ok(handle)
    }

    fn destroy_window(&self, window: WindowHandle) -> PlatformResult<()> {
        if !self.is_window(window) {
            return Err(PlatformError::InvalidHandle(format!(
                "window {window:?} does not exist"
            )));
        }
        let _ = self.deliver(window, WindowMessage::Destroying);
        for child in self.children_of(window) {
            self.destroy_window(child)?;
        }
        let _ = self.deliver(window, WindowMessage::Destroyed);

        let orphaned: VecDeque<Posted> = {
            let mut state = self.state.lock();
            state.windows.remove(&window);
            state.hit_test.retain(|_, hit| *hit != window);
            let (orphaned, kept): (VecDeque<Posted>, VecDeque<Posted>) =
                std::mem::take(&mut state.posted)
                .into_iter()
                .partition(|posted| matches!(posted, Posted::Message { target, .. } if *target == window));
            state.posted = kept;
            orphaned
        };
        if !orphaned.is_empty() {
            log::debug!(
                "Headless: releasing {} message(s) queued for destroyed window {window:?}.",
                orphaned.len()
            );
        }
        Ok(())
    }

    fn is_window(&self, window: WindowHandle) -> bool {
        self.state.lock().windows.contains_key(&window)
    }

    fn send_message(
        &self,
        target: WindowHandle,
        message: WindowMessage,
    ) -> Result<MessageResult, WindowMessage> {
        if self.is_bound_thread() {
            return self.deliver(target, message);
        }

        let (reply, response) = mpsc::sync_channel(1);
        {
            let mut state = self.state.lock();
            if !state.windows.contains_key(&target) {
                return Err(message);
            }
            state.sent.push_back(SentMessage {
                target,
                message,
                reply,
            });
            self.wakeup.notify_all();
        }
        // A dropped reply channel means the queue itself went away with the message in it.
        response.recv().unwrap_or(Ok(None))
    }

    fn post_message(
        &self,
        target: WindowHandle,
        message: WindowMessage,
    ) -> Result<(), WindowMessage> {
        let mut state = self.state.lock();
        if !state.windows.contains_key(&target) {
            return Err(message);
        }
        state.posted.push_back(Posted::Message { target, message });
        self.wakeup.notify_all();
        Ok(())
    }

    fn pump_one(&self, wait: bool) -> PumpOutcome {
        self.pump_until(wait, None)
    }

    fn pump_one_within(&self, timeout: Duration) -> PumpOutcome {
        self.pump_until(true, Some(Instant::now() + timeout))
    }

    fn post_quit(&self, exit_code: i32) {
        self.state.lock().quit_code = Some(exit_code);
        self.wakeup.notify_all();
    }

    fn install_pointer_hook(&self) -> PlatformResult<HookHandle> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_hook_install) {
            return Err(PlatformError::HookInstallFailed(
                "pointer hook refused".to_string(),
            ));
        }
        let hook = HookHandle(state.next_hook);
        state.next_hook += 1;
        state.hook = Some(hook);
        state.hook_installs += 1;
        Ok(hook)
    }

    fn uninstall_pointer_hook(&self, hook: HookHandle) -> PlatformResult<()> {
        let mut state = self.state.lock();
        if state.hook != Some(hook) {
            return Err(PlatformError::InvalidHandle(format!(
                "hook {hook:?} is not installed"
            )));
        }
        state.hook = None;
        state.hook_removals += 1;
        state.posted.retain(|posted| !matches!(posted, Posted::Pointer(_)));
        Ok(())
    }

    fn window_from_point(&self, point: Point) -> Option<WindowHandle> {
        self.state.lock().hit_test.get(&point).copied()
    }

    fn root_ancestor(&self, window: WindowHandle) -> Option<WindowHandle> {
        let state = self.state.lock();
        let mut current = window;
        loop {
            let parent = state.windows.get(&current)?.parent;
            match parent {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
    }

    fn apply_cursor(&self, cursor: CursorHandle) {
        self.state.lock().cursor = cursor;
    }

    fn default_cursor(&self) -> CursorHandle {
        DEFAULT_CURSOR
    }

    fn set_clipboard_viewer(&self, window: WindowHandle) -> PlatformResult<Option<WindowHandle>> {
        let mut state = self.state.lock();
        if !state.windows.contains_key(&window) {
            return Err(PlatformError::InvalidHandle(format!(
                "window {window:?} does not exist"
            )));
        }
        let previous = state.clipboard_viewers.last().copied();
        state.clipboard_viewers.push(window);
        Ok(previous)
    }

    fn change_clipboard_chain(
        &self,
        window: WindowHandle,
        next: Option<WindowHandle>,
    ) -> PlatformResult<()> {
        let first = {
            let mut state = self.state.lock();
            let before = state.clipboard_viewers.len();
            state.clipboard_viewers.retain(|viewer| *viewer != window);
            if state.clipboard_viewers.len() == before {
                return Err(PlatformError::InvalidHandle(format!(
                    "window {window:?} is not a clipboard viewer"
                )));
            }
            state.clipboard_viewers.last().copied()
        };
        if let Some(first) = first {
            let notice = WindowMessage::ClipboardChainChanged {
                removed: window,
                next,
            };
            if let Err(message) = self.deliver(first, notice) {
                log::debug!(
                    "Headless: first clipboard viewer {first:?} gone; {} dropped.",
                    message.name()
                );
            }
        }
        Ok(())
    }
}

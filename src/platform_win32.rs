/*
 * Win32 implementation of `Platform`. Every window class registered here
 * shares one window procedure, `conduit_wnd_proc`, which translates native
 * messages into `WindowMessage` and forwards them to the window procedure
 * bound to the current thread.
 *
 * Actions travel through the message queue as a leaked `Box<Action>` in
 * WPARAM. Whoever ends up holding the message reclaims the box: the window
 * procedure when it is delivered (and answers `ACTION_CONSUMED`), the sender
 * when sending or posting fails, and the `WM_NCDESTROY` handler for messages
 * still queued when the coordination window dies.
 *
 * No panic crosses back into the OS: the window procedure and the hook catch
 * it, log it and fall back to default handling.
 */

use crate::action::{Action, panic_message};
use crate::error::{PlatformError, Result as PlatformResult};
use crate::platform::{
    Platform, PumpOutcome, WindowProc, bind_thread_window_proc, thread_window_proc,
    unbind_thread_window_proc,
};
use crate::types::{
    ClassDescriptor, ClassToken, CursorHandle, HookHandle, MessageResult, Point, PointerEventKind,
    PointerHookEvent, SystemNotification, WindowHandle, WindowMessage, WindowParams,
};

use windows::{
    Win32::{
        Foundation::{
            GetLastError, HINSTANCE, HWND, LPARAM, LRESULT, POINT, SetLastError, WIN32_ERROR,
            WPARAM,
        },
        System::DataExchange::{ChangeClipboardChain, SetClipboardViewer},
        System::LibraryLoader::GetModuleHandleW,
        System::Threading::GetCurrentThreadId,
        UI::WindowsAndMessaging::*,
    },
    core::{HSTRING, PCWSTR},
};

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Weak;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub(crate) const WM_APP_RUN_ACTION: u32 = WM_APP + 0x200;
pub(crate) const WM_APP_RUN_ACTION_LATER: u32 = WM_APP + 0x201;
pub(crate) const WM_APP_WAKE: u32 = WM_APP + 0x202;

// Returned by the window procedure once it has taken ownership of a boxed action.
const ACTION_CONSUMED: isize = 1;

// Exit code reported when the message queue itself fails.
const QUEUE_FAILED_EXIT_CODE: i32 = -1;

pub struct Win32Platform {
    // HINSTANCE is a raw pointer; kept as an integer so the platform stays Send + Sync.
    instance: isize,
    bound_thread_id: AtomicU32,
}

impl Win32Platform {
    pub fn new() -> PlatformResult<Self> {
        let module = unsafe { GetModuleHandleW(PCWSTR::null()) }.map_err(|err| {
            PlatformError::InitializationFailed(format!("GetModuleHandleW failed: {err}"))
        })?;
        log::debug!("Win32: module handle {:?} acquired.", module.0);
        Ok(Self {
            instance: module.0 as isize,
            bound_thread_id: AtomicU32::new(0),
        })
    }

    fn h_instance(&self) -> HINSTANCE {
        HINSTANCE(self.instance as *mut c_void)
    }
}

fn to_hwnd(window: WindowHandle) -> HWND {
    HWND(window.raw() as *mut c_void)
}

fn to_hwnd_or_null(window: Option<WindowHandle>) -> HWND {
    window.map_or(HWND(std::ptr::null_mut()), to_hwnd)
}

fn from_hwnd(hwnd: HWND) -> Option<WindowHandle> {
    if hwnd.is_invalid() {
        None
    } else {
        Some(WindowHandle(hwnd.0 as isize))
    }
}

// MAKEINTATOM: a class atom can stand in for the class name.
fn class_atom(token: ClassToken) -> PCWSTR {
    PCWSTR(token.0 as usize as *const u16)
}

/*
 * Turns a message into its native form. Only messages a caller may send or
 * post have one; the rest are handed back.
 */
fn encode(message: WindowMessage) -> Result<(u32, WPARAM, LPARAM), WindowMessage> {
    match message {
        WindowMessage::RunAction(action) => Ok((WM_APP_RUN_ACTION, box_action(action), LPARAM(0))),
        WindowMessage::RunActionLater(action) => {
            Ok((WM_APP_RUN_ACTION_LATER, box_action(action), LPARAM(0)))
        }
        WindowMessage::Wake => Ok((WM_APP_WAKE, WPARAM(0), LPARAM(0))),
        WindowMessage::ClipboardChainChanged { removed, next } => Ok((
            WM_CHANGECBCHAIN,
            WPARAM(removed.raw() as usize),
            LPARAM(next.map_or(0, WindowHandle::raw)),
        )),
        WindowMessage::ClipboardChanged => Ok((WM_DRAWCLIPBOARD, WPARAM(0), LPARAM(0))),
        WindowMessage::Other {
            msg,
            wparam,
            lparam,
        } => Ok((msg, WPARAM(wparam), LPARAM(lparam))),
        other => Err(other),
    }
}

fn box_action(action: Action) -> WPARAM {
    WPARAM(Box::into_raw(Box::new(action)) as usize)
}

/// Reclaims a box created by `box_action`. Must be called exactly once per encoded message.
unsafe fn unbox_action(wparam: WPARAM) -> Action {
    *unsafe { Box::from_raw(wparam.0 as *mut Action) }
}

// Gives back the message for an encoded form that was never delivered.
fn reclaim(msg: u32, wparam: WPARAM, lparam: LPARAM) -> WindowMessage {
    match msg {
        WM_APP_RUN_ACTION => WindowMessage::RunAction(unsafe { unbox_action(wparam) }),
        WM_APP_RUN_ACTION_LATER => WindowMessage::RunActionLater(unsafe { unbox_action(wparam) }),
        WM_APP_WAKE => WindowMessage::Wake,
        _ => WindowMessage::Other {
            msg,
            wparam: wparam.0,
            lparam: lparam.0,
        },
    }
}

fn is_action_message(msg: u32) -> bool {
    msg == WM_APP_RUN_ACTION || msg == WM_APP_RUN_ACTION_LATER
}

fn translate(msg: u32, wparam: WPARAM, lparam: LPARAM) -> WindowMessage {
    match msg {
        WM_CREATE => WindowMessage::Created,
        WM_SETCURSOR => WindowMessage::SetCursor {
            client_area: (lparam.0 & 0xFFFF) as u32 == HTCLIENT,
        },
        WM_DESTROY => WindowMessage::Destroying,
        WM_NCDESTROY => WindowMessage::Destroyed,
        WM_SETTINGCHANGE if wparam.0 as u32 == SPI_SETWORKAREA.0 => {
            WindowMessage::System(SystemNotification::WorkAreaChanged)
        }
        WM_DISPLAYCHANGE => WindowMessage::System(SystemNotification::DisplayChanged),
        WM_THEMECHANGED => WindowMessage::System(SystemNotification::ThemeChanged),
        WM_CHANGECBCHAIN => match from_hwnd(HWND(wparam.0 as *mut c_void)) {
            Some(removed) => WindowMessage::ClipboardChainChanged {
                removed,
                next: from_hwnd(HWND(lparam.0 as *mut c_void)),
            },
            None => reclaim(msg, wparam, lparam),
        },
        WM_DRAWCLIPBOARD => WindowMessage::ClipboardChanged,
        _ => reclaim(msg, wparam, lparam),
    }
}

fn pointer_kind(msg: u32) -> PointerEventKind {
    match msg {
        WM_LBUTTONDOWN => PointerEventKind::LeftDown,
        WM_RBUTTONDOWN => PointerEventKind::RightDown,
        WM_MBUTTONDOWN => PointerEventKind::MiddleDown,
        WM_NCLBUTTONDOWN => PointerEventKind::NcLeftDown,
        WM_NCRBUTTONDOWN => PointerEventKind::NcRightDown,
        WM_NCMBUTTONDOWN => PointerEventKind::NcMiddleDown,
        WM_NCXBUTTONDOWN => PointerEventKind::NcXDown,
        WM_MOUSEACTIVATE => PointerEventKind::MouseActivate,
        WM_MOUSEMOVE => PointerEventKind::Move,
        other => PointerEventKind::Other(other),
    }
}

// Terminal outcome of a blocking GetMessageW, if any. A failed queue is treated as shut down.
fn get_message_outcome(status: i32, msg: &MSG) -> Option<PumpOutcome> {
    match status {
        0 => Some(PumpOutcome::Quit(msg.wParam.0 as i32)),
        -1 => Some(PumpOutcome::Quit(QUEUE_FAILED_EXIT_CODE)),
        _ => None,
    }
}

// Releases actions still queued for a window that is going away.
fn drain_queued_actions(hwnd: HWND) {
    let mut msg = MSG::default();
    let mut released = 0;
    while unsafe {
        PeekMessageW(
            &mut msg,
            Some(hwnd),
            WM_APP_RUN_ACTION,
            WM_APP_RUN_ACTION_LATER,
            PM_REMOVE,
        )
    }
    .as_bool()
    {
        drop(reclaim(msg.message, msg.wParam, msg.lParam));
        released += 1;
    }
    if released > 0 {
        log::debug!("Win32: released {released} queued action(s) for {hwnd:?}.");
    }
}

/*
 * Shared window procedure of every class registered by `Win32Platform`.
 */
unsafe extern "system" fn conduit_wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    let Some(window) = from_hwnd(hwnd) else {
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    };
    let action_message = is_action_message(msg);
    let message = translate(msg, wparam, lparam);

    let result = match thread_window_proc() {
        Some(window_proc) => {
            match panic::catch_unwind(AssertUnwindSafe(|| window_proc.window_proc(window, message))) {
                Ok(result) => result,
                Err(payload) => {
                    log::error!(
                        "Win32: handler for message {msg:#x} on {window:?} panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    None
                }
            }
        }
        None => {
            if action_message {
                log::warn!("Win32: no window procedure bound; {} released.", message.name());
            }
            drop(message);
            None
        }
    };

    if msg == WM_NCDESTROY {
        drain_queued_actions(hwnd);
    }
    if msg == WM_APP_RUN_ACTION {
        // The action may have changed loop state while GetMessageW is blocked around it.
        let _ = unsafe { PostThreadMessageW(GetCurrentThreadId(), WM_NULL, WPARAM(0), LPARAM(0)) };
    }

    if action_message {
        return LRESULT(ACTION_CONSUMED);
    }
    match result {
        Some(value) => LRESULT(value),
        None => unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) },
    }
}

/*
 * Low-level pointer hook. Observes only; every event is passed on.
 */
unsafe extern "system" fn pointer_hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code == HC_ACTION as i32 && lparam.0 != 0 {
        let info = unsafe { &*(lparam.0 as *const MSLLHOOKSTRUCT) };
        let event = PointerHookEvent {
            kind: pointer_kind(wparam.0 as u32),
            point: Point {
                x: info.pt.x,
                y: info.pt.y,
            },
        };
        if let Some(window_proc) = thread_window_proc() {
            let observed = panic::catch_unwind(AssertUnwindSafe(|| window_proc.pointer_hook(&event)));
            if let Err(payload) = observed {
                log::error!("Win32: pointer hook panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

impl Platform for Win32Platform {
    fn bind_window_proc(&self, window_proc: Weak<dyn WindowProc>) -> PlatformResult<()> {
        bind_thread_window_proc(window_proc)?;
        let thread_id = unsafe { GetCurrentThreadId() };
        self.bound_thread_id.store(thread_id, Ordering::Release);
        log::debug!("Win32: window procedure bound to thread {thread_id}.");
        Ok(())
    }

    fn unbind_window_proc(&self) {
        unbind_thread_window_proc();
        let thread_id = unsafe { GetCurrentThreadId() };
        let _ = self.bound_thread_id.compare_exchange(
            thread_id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn register_class(&self, class: &ClassDescriptor) -> PlatformResult<ClassToken> {
        let class_name = HSTRING::from(class.name.as_str());
        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(conduit_wnd_proc),
            hInstance: self.h_instance(),
            hCursor: HCURSOR(class.cursor.0 as *mut c_void),
            lpszClassName: PCWSTR(class_name.as_ptr()),
            ..Default::default()
        };

        let atom = unsafe { RegisterClassExW(&wc) };
        if atom == 0 {
            let error = unsafe { GetLastError() };
            log::error!("Win32: RegisterClassExW for '{}' failed: {error:?}", class.name);
            return Err(PlatformError::CreationFailed(format!(
                "RegisterClassExW for '{}' failed: {error:?}",
                class.name
            )));
        }
        log::debug!("Win32: class '{}' registered as atom {atom:#x}.", class.name);
        Ok(ClassToken(atom))
    }

    fn unregister_class(&self, token: ClassToken) -> PlatformResult<()> {
        unsafe { UnregisterClassW(class_atom(token), Some(self.h_instance())) }?;
        Ok(())
    }

    fn create_window(
        &self,
        class: ClassToken,
        params: &WindowParams,
    ) -> PlatformResult<WindowHandle> {
        let bounds = params.bounds;
        let hwnd = unsafe {
            CreateWindowExW(
                WINDOW_EX_STYLE(params.style.ex_style),
                class_atom(class),
                &HSTRING::from(params.name.as_str()),
                WINDOW_STYLE(params.style.style),
                bounds.x,
                bounds.y,
                bounds.width,
                bounds.height,
                params.parent.map(to_hwnd),
                None,
                Some(self.h_instance()),
                None,
            )
        }
        .map_err(|err| {
            PlatformError::CreationFailed(format!("CreateWindowExW for '{}' failed: {err}", params.name))
        })?;
        from_hwnd(hwnd).ok_or_else(|| {
            PlatformError::CreationFailed(format!("CreateWindowExW for '{}' returned null", params.name))
        })
    }

    fn destroy_window(&self, window: WindowHandle) -> PlatformResult<()> {
        unsafe { DestroyWindow(to_hwnd(window)) }.map_err(|err| {
            PlatformError::InvalidHandle(format!("DestroyWindow for {window:?} failed: {err}"))
        })
    }

    fn is_window(&self, window: WindowHandle) -> bool {
        unsafe { IsWindow(Some(to_hwnd(window))) }.as_bool()
    }

    fn send_message(
        &self,
        target: WindowHandle,
        message: WindowMessage,
    ) -> Result<MessageResult, WindowMessage> {
        if !self.is_window(target) {
            return Err(message);
        }
        let (msg, wparam, lparam) = encode(message)?;
        let result = unsafe { SendMessageW(to_hwnd(target), msg, Some(wparam), Some(lparam)) };
        if is_action_message(msg) {
            // Anything but the sentinel means no window procedure of ours took the box.
            return if result.0 == ACTION_CONSUMED {
                Ok(Some(0))
            } else {
                Err(reclaim(msg, wparam, lparam))
            };
        }
        Ok(Some(result.0))
    }

    fn post_message(
        &self,
        target: WindowHandle,
        message: WindowMessage,
    ) -> Result<(), WindowMessage> {
        let (msg, wparam, lparam) = encode(message)?;
        match unsafe { PostMessageW(Some(to_hwnd(target)), msg, wparam, lparam) } {
            Ok(()) => Ok(()),
            Err(err) => {
                log::debug!("Win32: PostMessageW to {target:?} failed: {err}");
                Err(reclaim(msg, wparam, lparam))
            }
        }
    }

    fn pump_one(&self, wait: bool) -> PumpOutcome {
        let mut msg = MSG::default();
        if wait {
            let status = unsafe { GetMessageW(&mut msg, None, 0, 0) };
            if status.0 == -1 {
                let error = unsafe { GetLastError() };
                log::error!("Win32: GetMessageW failed: {error:?}; treating the queue as shut down.");
            }
            if let Some(outcome) = get_message_outcome(status.0, &msg) {
                return outcome;
            }
        } else {
            if !unsafe { PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE) }.as_bool() {
                return PumpOutcome::Idle;
            }
            if msg.message == WM_QUIT {
                return PumpOutcome::Quit(msg.wParam.0 as i32);
            }
        }
        unsafe {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
        PumpOutcome::Dispatched
    }

    // A thread timer bounds the wait; its WM_TIMER counts as the event when nothing else arrives.
    fn pump_one_within(&self, timeout: Duration) -> PumpOutcome {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let timer = unsafe { SetTimer(None, 0, millis, None) };
        if timer == 0 {
            log::warn!("Win32: SetTimer failed; polling once instead of waiting.");
            return self.pump_one(false);
        }
        let outcome = self.pump_one(true);
        if let Err(err) = unsafe { KillTimer(None, timer) } {
            log::debug!("Win32: KillTimer failed: {err}");
        }
        outcome
    }

    fn post_quit(&self, exit_code: i32) {
        let bound = self.bound_thread_id.load(Ordering::Acquire);
        let current = unsafe { GetCurrentThreadId() };
        if bound == 0 || bound == current {
            unsafe { PostQuitMessage(exit_code) };
            return;
        }
        let posted = unsafe {
            PostThreadMessageW(bound, WM_QUIT, WPARAM(exit_code as usize), LPARAM(0))
        };
        if let Err(err) = posted {
            log::error!("Win32: posting quit to thread {bound} failed: {err}");
        }
    }

    fn install_pointer_hook(&self) -> PlatformResult<HookHandle> {
        let hook = unsafe {
            SetWindowsHookExW(WH_MOUSE_LL, Some(pointer_hook_proc), Some(self.h_instance()), 0)
        }
        .map_err(|err| PlatformError::HookInstallFailed(format!("SetWindowsHookExW failed: {err}")))?;
        log::debug!("Win32: low-level pointer hook {:?} installed.", hook.0);
        Ok(HookHandle(hook.0 as isize))
    }

    fn uninstall_pointer_hook(&self, hook: HookHandle) -> PlatformResult<()> {
        unsafe { UnhookWindowsHookEx(HHOOK(hook.0 as *mut c_void)) }?;
        Ok(())
    }

    fn window_from_point(&self, point: Point) -> Option<WindowHandle> {
        from_hwnd(unsafe { WindowFromPoint(POINT { x: point.x, y: point.y }) })
    }

    fn root_ancestor(&self, window: WindowHandle) -> Option<WindowHandle> {
        from_hwnd(unsafe { GetAncestor(to_hwnd(window), GA_ROOT) })
    }

    fn apply_cursor(&self, cursor: CursorHandle) {
        unsafe { SetCursor(Some(HCURSOR(cursor.0 as *mut c_void))) };
    }

    fn default_cursor(&self) -> CursorHandle {
        match unsafe { LoadCursorW(None, IDC_ARROW) } {
            Ok(cursor) => CursorHandle(cursor.0 as isize),
            Err(err) => {
                log::warn!("Win32: loading the arrow cursor failed: {err}");
                CursorHandle::default()
            }
        }
    }

    fn set_clipboard_viewer(&self, window: WindowHandle) -> PlatformResult<Option<WindowHandle>> {
        // A null result is only an error when the last error says so.
        unsafe { SetLastError(WIN32_ERROR(0)) };
        match unsafe { SetClipboardViewer(to_hwnd(window)) } {
            Ok(next) => Ok(from_hwnd(next)),
            Err(err) if err.code().is_ok() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn change_clipboard_chain(
        &self,
        window: WindowHandle,
        next: Option<WindowHandle>,
    ) -> PlatformResult<()> {
        // The result only reports what the next viewer answered.
        let _ = unsafe { ChangeClipboardChain(to_hwnd(window), to_hwnd_or_null(next)) };
        Ok(())
    }
}

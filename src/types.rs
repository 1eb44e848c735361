/*
 * Platform-agnostic value types exchanged between the coordination core and
 * the native backends. Handles are opaque integers: the core only compares
 * and hashes them, the backend is the only party that interprets them.
 */

use crate::action::Action;

/// Opaque native window identifier, assigned by the OS when the window is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub isize);

impl WindowHandle {
    pub fn raw(self) -> isize {
        self.0
    }
}

/// Token returned by window-class registration, needed to release the class later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassToken(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CursorHandle(pub isize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub isize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Raw style bits handed through to the backend untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStyle {
    pub style: u32,
    pub ex_style: u32,
}

/// Everything a backend needs to register a window class.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub name: String,
    pub cursor: CursorHandle,
}

/// Parameters for a single native window creation request.
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub parent: Option<WindowHandle>,
    pub bounds: Bounds,
    pub style: WindowStyle,
    pub name: String,
}

/*
 * Messages delivered to a window procedure. Backends translate their native
 * messages into this enum; anything the core does not care about arrives as
 * `Other` and falls back to default OS handling when left unprocessed.
 */
#[derive(Debug)]
pub enum WindowMessage {
    /// The window exists and is being initialized.
    Created,
    /// The pointer moved over the window; `client_area` is true when it is inside the client rect.
    SetCursor { client_area: bool },
    /// Destruction has started; children may still exist.
    Destroying,
    /// Terminal destruction notification. Nothing is delivered to the handle afterwards.
    Destroyed,
    /// Synchronous action; the sender is blocked until this returns.
    RunAction(Action),
    /// Deferred action; ownership moved into the queue with the message.
    RunActionLater(Action),
    /// No-op used to unblock a loop waiting on an empty queue.
    Wake,
    /// A system-wide setting changed.
    System(SystemNotification),
    /// `removed` left the clipboard-viewer chain; `next` takes its place.
    ClipboardChainChanged {
        removed: WindowHandle,
        next: Option<WindowHandle>,
    },
    /// The clipboard contents changed. Viewers pass this on to the next viewer in the chain.
    ClipboardChanged,
    Other { msg: u32, wparam: usize, lparam: isize },
}

impl WindowMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WindowMessage::Created => "Created",
            WindowMessage::SetCursor { .. } => "SetCursor",
            WindowMessage::Destroying => "Destroying",
            WindowMessage::Destroyed => "Destroyed",
            WindowMessage::RunAction(_) => "RunAction",
            WindowMessage::RunActionLater(_) => "RunActionLater",
            WindowMessage::Wake => "Wake",
            WindowMessage::System(_) => "System",
            WindowMessage::ClipboardChainChanged { .. } => "ClipboardChainChanged",
            WindowMessage::ClipboardChanged => "ClipboardChanged",
            WindowMessage::Other { .. } => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemNotification {
    /// The desktop work area changed, e.g. a taskbar moved.
    WorkAreaChanged,
    /// Resolution or monitor layout changed.
    DisplayChanged,
    ThemeChanged,
}

/// `None` means "not processed": the backend applies default handling.
pub type MessageResult = Option<isize>;

/// Kind of global pointer event observed by the low-level hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEventKind {
    LeftDown,
    RightDown,
    MiddleDown,
    NcLeftDown,
    NcRightDown,
    NcMiddleDown,
    NcXDown,
    MouseActivate,
    Move,
    Other(u32),
}

impl PointerEventKind {
    /// Presses and activations are the events that may start interacting with another window.
    pub fn is_press(self) -> bool {
        matches!(
            self,
            PointerEventKind::LeftDown
                | PointerEventKind::RightDown
                | PointerEventKind::MiddleDown
                | PointerEventKind::NcLeftDown
                | PointerEventKind::NcRightDown
                | PointerEventKind::NcMiddleDown
                | PointerEventKind::NcXDown
                | PointerEventKind::MouseActivate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerHookEvent {
    pub kind: PointerEventKind,
    pub point: Point,
}

/*
 * Coordination core for a single-threaded Win32 UI runtime. All windows and
 * their controllers live on one bound thread; this crate provides the pieces
 * that keep that arrangement usable:
 *
 * - a `Dispatcher` other threads use to run work on the bound thread, either
 *   blocking until it finishes or fire-and-forget;
 * - nested modal event loops that can be ended from any thread with a value;
 * - a registry associating native window handles with their controllers;
 * - a shared low-level pointer hook that resets grab state when the user
 *   clicks into a window this process does not own;
 * - relaying of system notifications and clipboard-viewer chain membership
 *   through the coordination window.
 *
 * `Toolkit` is the explicitly owned context tying these together. The OS is
 * reached only through the `Platform` trait: `Win32Platform` on Windows, and
 * `HeadlessPlatform`, an in-process queue with the same delivery rules, on
 * every target.
 */
pub mod action;
pub mod config;
pub(crate) mod coordination;
pub(crate) mod deferred;
pub mod dispatcher;
pub mod error;
pub(crate) mod hook;
pub mod nested_loop;
pub mod platform;
pub mod platform_headless;
#[cfg(target_os = "windows")]
pub mod platform_win32;
pub mod registry;
pub mod toolkit;
pub mod types;

pub use action::{Action, Delivery};
pub use config::ToolkitConfig;
pub use dispatcher::Dispatcher;
pub use error::{PlatformError, Result as PlatformResult};
pub use nested_loop::LoopValue;
pub use platform::{Platform, PumpOutcome, WindowProc};
pub use platform_headless::HeadlessPlatform;
#[cfg(target_os = "windows")]
pub use platform_win32::Win32Platform;
pub use registry::WindowController;
pub use toolkit::Toolkit;
pub use types::{
    Bounds, ClassDescriptor, ClassToken, CursorHandle, HookHandle, MessageResult, Point,
    PointerEventKind, PointerHookEvent, SystemNotification, WindowHandle, WindowMessage, WindowParams, WindowStyle,
};

/*
 * Error type shared by every layer of the crate. Failures that a caller can
 * act on (a window that could not be created, a hook the OS refused) are
 * returned as `PlatformError`; conditions caused by outliving the dispatcher
 * are absorbed and only logged by the components that hit them.
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Class registration or native window creation failed. No registration is left behind.
    #[error("window creation failed: {0}")]
    CreationFailed(String),

    #[error("hook installation failed: {0}")]
    HookInstallFailed(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

#[cfg(target_os = "windows")]
impl From<windows::core::Error> for PlatformError {
    fn from(err: windows::core::Error) -> Self {
        PlatformError::OperationFailed(format!("Win32 error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

//! Shared error type for the RHI.
//!
//! Factory methods still return `Option` handles (failure is logged at error
//! verbosity and surfaced as `None`); `RhiError` carries the failure kind
//! everywhere a `Result` is the natural shape — submission, descriptor
//! updates, uploads.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RhiError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("surface lost")]
    SurfaceLost,

    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    /// Fatal. The device refuses all further submissions once this is
    /// reported.
    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("file i/o error: {0}")]
    FileIo(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

pub type RhiResult<T> = Result<T, RhiError>;

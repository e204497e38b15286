//! Errors of the drm backend

use std::{io, path::PathBuf};

use crate::backend::allocator::format::FormatError;

/// DRM access error
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors thrown when importing a buffer into a [`BoCache`](super::BoCache)
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The buffer handle is malformed
    #[error("invalid buffer handle: {0}")]
    InvalidHandle(&'static str),
    /// The buffer format or layout cannot be scanned out
    #[error("unsupported buffer format")]
    UnsupportedFormat(#[from] FormatError),
    /// Creating the kernel resources for the buffer failed
    #[error("failed to bind the buffer to a framebuffer")]
    ResourceBindFailed(#[from] AccessError),
}

impl ImportError {
    /// Returns true if importing the same buffer may succeed on a later attempt.
    ///
    /// Kernel resources may be exhausted temporarily, malformed handles and
    /// unsupported formats stay unsupported.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImportError::ResourceBindFailed(_))
    }
}

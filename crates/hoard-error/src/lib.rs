#![forbid(unsafe_code)]
//! Error types for the hoard block cache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for callers that speak POSIX.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("origin read failed: errno {errno}")]
    Origin { errno: i32 },

    #[error("cache file open failed: {0}")]
    OpenFailure(String),

    #[error("short read from cache data file at block {index}")]
    ShortRead { index: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid side-car format: {0}")]
    Format(String),
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Origin { errno } => {
                if *errno > 0 {
                    *errno
                } else {
                    libc::EIO
                }
            }
            Self::OpenFailure(_) => libc::EIO,
            Self::ShortRead { .. } => libc::EIO,
            Self::Config(_) | Self::Format(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

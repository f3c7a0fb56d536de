#![forbid(unsafe_code)]
//! Error types for the PWL write log.
//!
//! Defines `PwlError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for block-layer response codes.

use thiserror::Error;

/// Unified error type for all PWL operations.
#[derive(Debug, Error)]
pub enum PwlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image is read-only")]
    ReadOnly,

    #[error("pool layout mismatch: {field} is {actual}, expected {expected}")]
    Layout {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("invalid pool format: {0}")]
    Format(String),

    #[error("log replay failed: {0}")]
    Replay(String),

    #[error("pool transaction aborted: {0}")]
    TxAborted(String),

    #[error("corrupt log slot {index}: {detail}")]
    Corruption { index: u32, detail: String },

    #[error("no space left in pool")]
    NoSpace,

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache is shutting down")]
    ShuttingDown,

    #[error("compare mismatch at offset {offset}")]
    CompareMismatch { offset: u64 },
}

impl PwlError {
    /// Convert this error into a POSIX errno suitable for block-layer replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ReadOnly => libc::EROFS,
            Self::Layout { .. } | Self::Format(_) | Self::Replay(_) => libc::EINVAL,
            Self::TxAborted(_) | Self::Corruption { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::Cancelled => libc::ECANCELED,
            Self::ShuttingDown => libc::ESHUTDOWN,
            Self::CompareMismatch { .. } => libc::EILSEQ,
        }
    }
}

/// Result alias using `PwlError`.
pub type Result<T> = std::result::Result<T, PwlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        assert_eq!(PwlError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(
            PwlError::Replay("bad order".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            PwlError::Layout {
                field: "block_size",
                expected: 4096,
                actual: 512
            }
            .to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            PwlError::TxAborted("append".to_owned()).to_errno(),
            libc::EIO
        );
        assert_eq!(PwlError::NoSpace.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn io_errno_passthrough() {
        let err = PwlError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}

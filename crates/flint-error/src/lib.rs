#![forbid(unsafe_code)]
//! Error types for FlintFS.
//!
//! Defines `FlintError` and a `Result<T>` alias used throughout the
//! workspace. Internal commit outcomes (relocated, dropped, orphaned) are a
//! separate enum in `flint-core` and never leak through this type.

use thiserror::Error;

/// Unified error type for all FlintFS operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlintError {
    #[error("error during device operation")]
    Io,

    #[error("corrupted metadata or unreadable erased state")]
    Corrupt,

    #[error("no directory entry")]
    NoEnt,

    #[error("entry already exists")]
    Exists,

    #[error("entry is not a directory")]
    NotDir,

    #[error("entry is a directory")]
    IsDir,

    #[error("directory not empty")]
    NotEmpty,

    #[error("operation invalid for file handle mode")]
    BadFd,

    #[error("file too large")]
    FileTooBig,

    #[error("invalid parameter")]
    Inval,

    #[error("no space left on device")]
    NoSpace,

    #[error("no attribute available")]
    NoAttr,

    #[error("file name too long")]
    NameTooLong,
}

/// Result alias using `FlintError`.
pub type Result<T> = std::result::Result<T, FlintError>;

//! Crate-wide error type.
//!
//! The original formatter-only code in this crate threaded a distinct,
//! device-error-generic enum through every module (`RootError<O>`,
//! `DirectoryError<O>`, `FileParserError<O>`, ...). That pattern never
//! reached completion even in scope here (the directory-traversal code
//! that needed it was left unfinished) and does not scale to a read-write
//! filesystem with mutation, mounting and checking layered on top of
//! parsing. Every I/O failure is instead collapsed into [`Error::Io`] at
//! the point it crosses from `std::io::Error` into this crate's error
//! type, and each higher-level failure domain gets its own variant.

use std::fmt;

/// The single error type returned by every fallible operation in this
/// crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    Exists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid name")]
    InvalidName,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no space left on device")]
    NoSpace,
    #[error("filesystem is read-only")]
    ReadOnly,
    #[error("permission denied")]
    PermissionDenied,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("corrupted filesystem: {0}")]
    Corrupted(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Wraps a `std::io::Error` observed at a device I/O boundary.
    pub(crate) fn io(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }

    pub(crate) fn corrupted(msg: impl fmt::Display) -> Self {
        Error::Corrupted(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::io(err)
    }
}

/// Panics with a message in the style of `exfat_bug`: these signal a
/// violated internal invariant, never a condition a caller can recover
/// from (a malformed on-disk structure is a [`Error::Corrupted`], not a
/// bug).
#[track_caller]
pub(crate) fn bug(msg: impl fmt::Display) -> ! {
    panic!("exfat-fs: internal invariant violated: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_is_wrapped_with_message() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("eof"));
    }

    #[test]
    #[should_panic(expected = "internal invariant violated")]
    fn bug_panics() {
        bug("unreachable state");
    }
}

//! Error kinds shared by the client API, the server dispatcher, and the
//! membership controller.
//!
//! Every XPN operation surfaces a POSIX-like `(return, errno)` pair at its
//! API boundary (see the wire protocol's `status`/`ret` fields). [`XpnError`]
//! is the in-process representation; [`XpnError::errno`] maps it to the
//! numeric code that crosses the wire or that a POSIX-style caller expects.

use std::fmt;

/// Everything that can go wrong inside the client, the server, or the
/// membership controller.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum XpnError {
    /// Malformed path, negative size, or null/empty buffer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocator failure or similar local resource exhaustion.
    #[error("out of memory")]
    NoMemory,

    /// The client file-handle registry (or a server session table) has no
    /// more descriptors to hand out.
    #[error("too many open files")]
    TooManyOpenFiles,

    /// `ENOENT` — propagated from the underlying local filesystem.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// `EEXIST` — propagated from the underlying local filesystem.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// `EISDIR` — the target of a file-only operation is a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// `ENOTDIR` — a non-directory was used where a directory was
    /// required.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// `ENOTEMPTY` — `rmdir` on a non-empty directory.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Channel failure (connect, accept, send, or recv). The caller may
    /// retry after reconnecting.
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel closed or timed out mid-request.
    #[error("transport timed out")]
    TimedOut,

    /// Metadata header magic/version mismatch. Never fatal: treated as an
    /// absent header, recomputed on next write.
    #[error("corrupt metadata header for {0}")]
    CorruptMetadata(String),

    /// Transport initialization failure or session-table corruption: the
    /// process should abort rather than continue in an inconsistent state.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Wraps a [`std::io::Error`] raised by the local filesystem backend.
    #[error("i/o error: {0}")]
    Io(String),
}

impl XpnError {
    /// Maps an error kind to the POSIX errno it corresponds to on the wire.
    pub fn errno(&self) -> i32 {
        match self {
            XpnError::InvalidArgument(_) => libc_einval(),
            XpnError::NoMemory => libc_enomem(),
            XpnError::TooManyOpenFiles => libc_emfile(),
            XpnError::NotFound(_) => libc_enoent(),
            XpnError::AlreadyExists(_) => libc_eexist(),
            XpnError::IsDirectory(_) => libc_eisdir(),
            XpnError::NotDirectory(_) => libc_enotdir(),
            XpnError::NotEmpty(_) => libc_enotempty(),
            XpnError::Transport(_) => libc_eio(),
            XpnError::TimedOut => libc_etimedout(),
            XpnError::CorruptMetadata(_) => 0,
            XpnError::Fatal(_) => libc_eio(),
            XpnError::Io(_) => libc_eio(),
        }
    }

    /// True for errors the caller may retry after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, XpnError::Transport(_) | XpnError::TimedOut)
    }
}

impl From<std::io::Error> for XpnError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => XpnError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => XpnError::AlreadyExists(err.to_string()),
            ErrorKind::TimedOut => XpnError::TimedOut,
            _ => XpnError::Io(err.to_string()),
        }
    }
}

/// Result alias used throughout the crate.
pub type XpnResult<T> = Result<T, XpnError>;

/// A `(return <= 0, errno)` pair, the shape every wire response and every
/// client API call collapses to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Posix {
    pub ret: i64,
    pub errno: i32,
}

impl Posix {
    pub fn ok(ret: i64) -> Self {
        Self { ret, errno: 0 }
    }

    pub fn from_error(err: &XpnError) -> Self {
        Self { ret: -1, errno: err.errno() }
    }
}

impl fmt::Display for Posix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ret={} errno={}", self.ret, self.errno)
    }
}

// Small local shims so this module does not need to depend on `libc` just
// for a handful of well-known constants shared by every POSIX target.
fn libc_einval() -> i32 {
    22
}
fn libc_enomem() -> i32 {
    12
}
fn libc_emfile() -> i32 {
    24
}
fn libc_enoent() -> i32 {
    2
}
fn libc_eexist() -> i32 {
    17
}
fn libc_eisdir() -> i32 {
    21
}
fn libc_enotdir() -> i32 {
    20
}
fn libc_enotempty() -> i32 {
    39
}
fn libc_eio() -> i32 {
    5
}
fn libc_etimedout() -> i32 {
    110
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(XpnError::NotFound("x".into()).errno(), 2);
        assert_eq!(XpnError::Transport("x".into()).errno(), 5);
    }

    #[test]
    fn corrupt_metadata_is_never_fatal() {
        let err = XpnError::CorruptMetadata("/a/b".into());
        assert!(!err.is_retryable());
        assert_eq!(Posix::from_error(&err).errno, 0);
    }
}

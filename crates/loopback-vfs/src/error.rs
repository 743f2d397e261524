// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[cfg(test)]
#[path = "./error_test.rs"]
mod error_test;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while serving the mirrored filesystem.
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The kernel referred to an inode that is not (or no longer) in the table.
    #[error("Unknown inode {0}")]
    UnknownInode(u64),

    /// A name does not exist under its parent directory.
    #[error("No entry {name:?} in {parent}")]
    NoEntry { parent: PathBuf, name: OsString },

    /// The operation is intentionally not implemented.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// A change was requested on a read-only mount.
    #[error("Filesystem is mounted read-only")]
    ReadOnly,

    /// A read or directory listing was requested past its end.
    #[error("Offset {offset} is beyond the end ({len})")]
    OffsetOutOfRange { offset: u64, len: u64 },

    /// An unexpected failure reading from the backing store.
    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A mutating host operation failed, its errno is reported as-is.
    #[error("Failed to {op} {path}")]
    Host {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid path {0}")]
    InvalidPath(PathBuf, #[source] io::Error),
    #[error("Cannot load config, lock has been poisoned: {0}")]
    LockPoisonedRead(String),
    #[error(transparent)]
    #[diagnostic(code("loopback::config"))]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn host(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Host {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for the frequent, expected outcomes that are answered
    /// without being logged as failures.
    pub fn is_expected(&self) -> bool {
        match self {
            Error::UnknownInode(_) | Error::NoEntry { .. } | Error::Unsupported(_) => true,
            Error::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Errors that can be reported back to the kernel as an errno.
pub trait OsError {
    /// The errno for this error, if it has a sensible one.
    fn os_error(&self) -> Option<i32>;
}

impl OsError for io::Error {
    fn os_error(&self) -> Option<i32> {
        match self.raw_os_error() {
            Some(errno) => Some(errno),
            None => match self.kind() {
                io::ErrorKind::NotFound => Some(libc::ENOENT),
                io::ErrorKind::UnexpectedEof => Some(libc::EIO),
                _ => None,
            },
        }
    }
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::UnknownInode(_) | Error::NoEntry { .. } => Some(libc::ENOENT),
            Error::Unsupported(_) => Some(libc::ENOSYS),
            Error::ReadOnly => Some(libc::EROFS),
            Error::OffsetOutOfRange { .. } => Some(libc::EIO),
            // unexpected read failures collapse into a generic I/O error
            Error::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                Some(libc::ENOENT)
            }
            Error::Io { .. } => Some(libc::EIO),
            Error::Host { source, .. } => source.os_error(),
            _ => None,
        }
    }
}

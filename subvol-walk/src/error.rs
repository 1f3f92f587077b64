// SPDX-License-Identifier: GPL-3.0-only

use nix::errno::Errno;
use thiserror::Error;

/// Error types for subvolume enumeration
#[derive(Error, Debug)]
pub enum WalkError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not a Btrfs filesystem: {0}")]
    NotBtrfs(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a subvolume: {0}")]
    NotSubvolume(String),

    #[error("Subvolume {0} not found")]
    NoSuchSubvolume(u64),

    #[error("Subvolume {0} disappeared")]
    Gone(u64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Subvolume iterator is closed")]
    Closed,

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: Errno,
    },
}

/// Coarse grouping of [`WalkError`] used to decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Resolution,
    Permission,
    Race,
    Unsupported,
    FatalIo,
    Closed,
}

impl WalkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WalkError::InvalidArgument(_) => ErrorClass::Config,
            WalkError::NotBtrfs(_)
            | WalkError::NotFound(_)
            | WalkError::NotSubvolume(_)
            | WalkError::NoSuchSubvolume(_) => ErrorClass::Resolution,
            WalkError::PermissionDenied(_) => ErrorClass::Permission,
            WalkError::Gone(_) => ErrorClass::Race,
            WalkError::NotSupported(_) => ErrorClass::Unsupported,
            WalkError::Io { .. } => ErrorClass::FatalIo,
            WalkError::Closed => ErrorClass::Closed,
        }
    }

    pub(crate) fn io(op: &'static str, source: Errno) -> Self {
        WalkError::Io { op, source }
    }
}

/// What a failed primitive means for the walk in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The entry was removed or replaced after it was observed.
    Vanished,
    Denied,
    Unsupported,
    Fatal,
}

pub(crate) fn disposition(errno: Errno) -> Disposition {
    match errno {
        Errno::ENOENT | Errno::ENOTDIR | Errno::ESTALE | Errno::ENXIO => Disposition::Vanished,
        Errno::EACCES | Errno::EPERM => Disposition::Denied,
        Errno::ENOTTY | Errno::EOPNOTSUPP | Errno::ENOSYS | Errno::EINVAL => {
            Disposition::Unsupported
        }
        _ => Disposition::Fatal,
    }
}

/// Result type alias for subvolume enumeration
pub type Result<T> = std::result::Result<T, WalkError>;

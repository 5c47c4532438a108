#![forbid(unsafe_code)]
//! Error types for herdfs.
//!
//! One taxonomy covers every operation in the allocator and attribute layers.
//! Each variant is either *ordinary* (the caller recovers: a failed exclusive
//! create just reports existence) or *fatal* (the volume withdraws: on-disk
//! state can no longer be trusted). [`HerdError::is_fatal`] carries that split
//! as a single tag; there is no separate panic path.
//!
//! `herd-error` must not depend on `herd-types` (the parse layer converts its
//! own `ParseError` into [`HerdError::Parse`] at crate boundaries, the same
//! direction every other internal error flows).
//!
//! Every variant maps to exactly one POSIX errno via [`HerdError::to_errno`].
//! The match is exhaustive so a new variant is a compile error until its errno
//! is assigned.

use thiserror::Error;

/// Unified error type for all herdfs operations.
#[derive(Debug, Error)]
pub enum HerdError {
    /// Malformed request: empty attribute name, name over the limit, zero-count
    /// reservation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Value too large for the format, or a caller buffer too small for the
    /// stored data.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Named object (attribute, block mapping) does not exist.
    #[error("not found")]
    NotFound,

    /// Exclusive create of something that already exists.
    #[error("already exists")]
    AlreadyExists,

    /// Inode is flagged immutable or append-only.
    #[error("permission denied")]
    PermissionDenied,

    /// Allocator exhausted every resource group after a full blocking circuit.
    #[error("no space left on device")]
    NoSpace,

    /// Operation recognized but deliberately not implemented.
    #[error("operation not supported")]
    Unsupported,

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse-layer error surfaced across a crate boundary.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk metadata corruption detected at a known block: bad magic or
    /// type tag, malformed record chain, bitmap/header mismatch. Always fatal
    /// at the volume level.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    /// The volume has already withdrawn; no further writes are accepted.
    #[error("volume withdrawn")]
    Withdrawn,
}

impl HerdError {
    /// Whether this error takes the whole volume down (withdrawal) rather than
    /// failing a single operation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Withdrawn)
    }

    /// Convert this error into a POSIX errno for the file-operation layer.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfRange(_) => libc::ERANGE,
            Self::NotFound => libc::ENODATA,
            Self::AlreadyExists => libc::EEXIST,
            Self::PermissionDenied => libc::EPERM,
            Self::NoSpace => libc::ENOSPC,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Parse(_) => libc::EINVAL,
            Self::Corrupt { .. } => libc::EIO,
            Self::Withdrawn => libc::EROFS,
        }
    }
}

/// Result alias using `HerdError`.
pub type Result<T> = std::result::Result<T, HerdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(HerdError, libc::c_int)> = vec![
            (HerdError::InvalidArgument("x".into()), libc::EINVAL),
            (HerdError::OutOfRange("x".into()), libc::ERANGE),
            (HerdError::NotFound, libc::ENODATA),
            (HerdError::AlreadyExists, libc::EEXIST),
            (HerdError::PermissionDenied, libc::EPERM),
            (HerdError::NoSpace, libc::ENOSPC),
            (HerdError::Unsupported, libc::EOPNOTSUPP),
            (HerdError::Io(std::io::Error::other("x")), libc::EIO),
            (HerdError::Parse("x".into()), libc::EINVAL),
            (
                HerdError::Corrupt {
                    block: 7,
                    detail: "x".into(),
                },
                libc::EIO,
            ),
            (HerdError::Withdrawn, libc::EROFS),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn only_corruption_class_is_fatal() {
        assert!(
            HerdError::Corrupt {
                block: 0,
                detail: "t".into()
            }
            .is_fatal()
        );
        assert!(HerdError::Withdrawn.is_fatal());
        assert!(!HerdError::NoSpace.is_fatal());
        assert!(!HerdError::NotFound.is_fatal());
        assert!(!HerdError::PermissionDenied.is_fatal());
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(HerdError::Io(raw).to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        let err = HerdError::Corrupt {
            block: 42,
            detail: "bad type tag".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: bad type tag");
        assert_eq!(HerdError::NoSpace.to_string(), "no space left on device");
    }
}

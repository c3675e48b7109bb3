//! Error types for archive operations.
//!
//! This module provides the [`Error`] enum which represents all possible
//! failure modes when probing, opening and extracting containers, along with
//! a convenient [`Result<T>`] type alias.
//!
//! # Archive-level versus item-level errors
//!
//! Errors returned from [`Archive::open`] describe the container as a whole.
//! Errors that happen while decoding one item never abort a bulk extraction;
//! they are mapped onto the closed [`ItemOutcome`] vocabulary through
//! [`Error::outcome`] and reported per item.
//!
//! ```rust
//! use arkiv::{Error, ItemOutcome};
//!
//! let err = Error::data("inflate stream ended early");
//! assert_eq!(err.outcome(), Some(ItemOutcome::DataError));
//! assert!(err.is_corruption());
//! ```
//!
//! [`Archive::open`]: crate::Archive::open
//! [`ItemOutcome`]: crate::ItemOutcome

use std::io;

use crate::codec::Method;
use crate::read::ItemOutcome;

/// Helper struct for formatting CrcMismatch error messages.
struct CrcMismatchDisplay<'a> {
    item_index: usize,
    item_name: Option<&'a str>,
    expected: u32,
    actual: u32,
}

impl std::fmt::Display for CrcMismatchDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CRC mismatch for item {}", self.item_index)?;
        if let Some(name) = self.item_name {
            write!(f, " ({})", name)?;
        }
        write!(f, ": expected {:#010x}, got {:#010x}", self.expected, self.actual)
    }
}

/// The main error type for archive operations.
///
/// # Error Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | I/O | [`Io`][Self::Io] | Underlying stream failures |
/// | Detection | [`NotThisFormat`][Self::NotThisFormat], [`NeedMoreBytes`][Self::NeedMoreBytes] | Probing the wrong parser |
/// | Format | [`InvalidFormat`][Self::InvalidFormat], [`CorruptHeader`][Self::CorruptHeader], [`UnexpectedEnd`][Self::UnexpectedEnd] | Damaged metadata |
/// | Data | [`DataError`][Self::DataError], [`CrcMismatch`][Self::CrcMismatch] | Damaged payload |
/// | Compatibility | [`UnsupportedMethod`][Self::UnsupportedMethod], [`UnsupportedFeature`][Self::UnsupportedFeature] | Missing codecs |
/// | Credentials | [`PasswordRequired`][Self::PasswordRequired], [`WrongPassword`][Self::WrongPassword] | Encrypted content |
/// | Resources | [`ResourceLimitExceeded`][Self::ResourceLimitExceeded] | Safety limits |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred on the input stream or an output sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream does not use the layout of the parser that was tried.
    ///
    /// This is the expected result of probing a parser against foreign data.
    /// [`Archive::open`](crate::Archive::open) treats it as "try the next
    /// candidate" and only returns it when no parser accepted the stream.
    #[error("Not a recognized archive format")]
    NotThisFormat,

    /// The stream is shorter than the smallest valid header.
    #[error("Need at least {needed} bytes to recognize the format")]
    NeedMoreBytes {
        /// Minimum number of bytes the parser needs.
        needed: u64,
    },

    /// The archive structure is invalid beyond recovery.
    #[error("Invalid archive: {0}")]
    InvalidFormat(String),

    /// A header is corrupt at a known position.
    ///
    /// The error includes the byte offset where corruption was detected.
    #[error("Corrupt header at offset {offset:#x}: {reason}")]
    CorruptHeader {
        /// The byte offset where corruption was detected.
        offset: u64,
        /// A description of the corruption.
        reason: String,
    },

    /// Declared sizes imply more bytes than the stream holds.
    #[error("Unexpected end of data at offset {offset:#x}")]
    UnexpectedEnd {
        /// Offset at which data ran out.
        offset: u64,
    },

    /// The item uses a compression method this build cannot decode.
    ///
    /// Enable the corresponding feature flag when building:
    /// ```toml
    /// arkiv = { version = "0.1", features = ["lzma", "deflate", "bzip2"] }
    /// ```
    #[error("Unsupported method: {method}")]
    UnsupportedMethod {
        /// The method that is not supported.
        method: Method,
    },

    /// A feature required by the archive is not supported.
    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature {
        /// The name of the unsupported feature.
        feature: &'static str,
    },

    /// Decoding produced the wrong amount of data or failed outright.
    #[error("Data error: {0}")]
    DataError(String),

    /// The CRC of decoded data does not match the stored value.
    #[error("{}", CrcMismatchDisplay { item_index: *item_index, item_name: item_name.as_deref(), expected: *expected, actual: *actual })]
    CrcMismatch {
        /// The index of the item with the mismatch.
        item_index: usize,
        /// The item name (if known).
        item_name: Option<String>,
        /// The expected CRC value from the archive.
        expected: u32,
        /// The actual CRC value of the decoded data.
        actual: u32,
    },

    /// Encrypted content was found but no password was supplied.
    #[error("password required for encrypted content")]
    PasswordRequired,

    /// The supplied password failed the archive's password check.
    #[error("Wrong password{}", item_index.map(|i| format!(" for item {}", i)).unwrap_or_default())]
    WrongPassword {
        /// The item where the wrong password was detected (if known).
        item_index: Option<usize>,
    },

    /// A volume of a multi-part archive could not be opened.
    #[error("Volume {volume} unavailable: '{name}'")]
    VolumeUnavailable {
        /// Zero-based volume number.
        volume: u32,
        /// The name that was requested from the volume provider.
        name: String,
    },

    /// A declared size exceeds the configured [`Limits`](crate::Limits).
    ///
    /// Checked before any allocation based on that size.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// The operation was cancelled through the progress reporter.
    #[error("Operation cancelled")]
    Cancelled,

    /// An item index is outside the item table.
    #[error("Item index {index} out of range (archive has {len} items)")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of items in the table.
        len: usize,
    },

    /// An item path would escape the extraction directory.
    #[error("Path traversal detected in item {item_index}: {path}")]
    PathTraversal {
        /// The index of the offending item.
        item_index: usize,
        /// The stored path.
        path: String,
    },
}

impl Error {
    /// Returns `true` if this error indicates damaged archive data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptHeader { .. }
                | Error::UnexpectedEnd { .. }
                | Error::DataError(_)
                | Error::CrcMismatch { .. }
                | Error::InvalidFormat(_)
        )
    }

    /// Returns `true` if this error is due to an unsupported method or feature.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedMethod { .. } | Error::UnsupportedFeature { .. }
        )
    }

    /// Returns `true` if this error is related to encryption.
    pub fn is_encryption_error(&self) -> bool {
        matches!(self, Error::PasswordRequired | Error::WrongPassword { .. })
    }

    /// Returns `true` if the error comes from probing a foreign layout.
    ///
    /// Detection falls through to the next parser on these errors.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(
            self,
            Error::NotThisFormat
                | Error::NeedMoreBytes { .. }
                | Error::InvalidFormat(_)
                | Error::CorruptHeader { .. }
                | Error::UnexpectedEnd { .. }
        )
    }

    /// Returns the item index associated with this error, if any.
    pub fn item_index(&self) -> Option<usize> {
        match self {
            Error::CrcMismatch { item_index, .. } | Error::PathTraversal { item_index, .. } => {
                Some(*item_index)
            }
            Error::WrongPassword { item_index } => *item_index,
            _ => None,
        }
    }

    /// Maps an item-scoped error onto the per-item outcome vocabulary.
    ///
    /// Returns `None` for errors that are fatal to the whole operation:
    /// I/O failures, cancellation and exhausted resource limits.
    pub fn outcome(&self) -> Option<ItemOutcome> {
        match self {
            Error::DataError(_) => Some(ItemOutcome::DataError),
            Error::CrcMismatch { .. } => Some(ItemOutcome::CrcError),
            Error::UnsupportedMethod { .. } | Error::UnsupportedFeature { .. } => {
                Some(ItemOutcome::UnsupportedMethod)
            }
            Error::CorruptHeader { .. } | Error::InvalidFormat(_) | Error::NotThisFormat => {
                Some(ItemOutcome::HeadersError)
            }
            Error::UnexpectedEnd { .. } | Error::NeedMoreBytes { .. } => {
                Some(ItemOutcome::UnexpectedEnd)
            }
            Error::VolumeUnavailable { .. } => Some(ItemOutcome::Unavailable),
            Error::PasswordRequired => Some(ItemOutcome::PasswordRequired),
            Error::WrongPassword { .. } => Some(ItemOutcome::WrongPassword),
            Error::Io(e) if e.kind() == io::ErrorKind::InvalidData => Some(ItemOutcome::DataError),
            Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Some(ItemOutcome::UnexpectedEnd)
            }
            _ => None,
        }
    }

    /// Creates a CorruptHeader error.
    pub fn corrupt_header(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptHeader {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a DataError.
    pub fn data(reason: impl Into<String>) -> Self {
        Error::DataError(reason.into())
    }

    /// Creates an UnsupportedMethod error.
    pub fn unsupported(method: Method) -> Self {
        Error::UnsupportedMethod { method }
    }

    /// Creates a ResourceLimitExceeded error for a declared size.
    pub fn limit(what: &str, value: u64, max: u64) -> Self {
        Error::ResourceLimitExceeded(format!("{} {} exceeds limit {}", what, value, max))
    }
}

impl Error {
    /// Recovers a crate error that travelled through an `io::Error`.
    ///
    /// Readers such as [`BlockReader`](crate::cache::BlockReader) wrap crate
    /// errors to satisfy `Read`; this unwraps them again so the original
    /// variant reaches the caller.
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                return match inner.downcast::<Error>() {
                    Ok(e) => *e,
                    Err(other) => Error::Io(io::Error::other(other)),
                };
            }
            return Error::Io(io::Error::other("unrecoverable wrapped error"));
        }
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(e) => e,
            other => {
                let kind = match other {
                    Error::UnexpectedEnd { .. } => io::ErrorKind::UnexpectedEof,
                    Error::Cancelled => io::ErrorKind::Interrupted,
                    _ => io::ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

/// A specialized Result type for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_corrupt_header() {
        let err = Error::corrupt_header(0x1234, "bad name table");
        let msg = err.to_string();
        assert!(msg.contains("0x1234"));
        assert!(msg.contains("bad name table"));
        assert!(err.is_corruption());
        assert!(err.is_format_mismatch());
    }

    #[test]
    fn test_unsupported_method() {
        let err = Error::unsupported(Method::Lzx);
        assert!(err.to_string().contains("LZX"));
        assert!(err.is_unsupported());
        assert_eq!(err.outcome(), Some(ItemOutcome::UnsupportedMethod));
    }

    #[test]
    fn test_crc_mismatch() {
        let err = Error::CrcMismatch {
            item_index: 3,
            item_name: Some("lib/a.o".into()),
            expected: 0xDEADBEEF,
            actual: 0x12345678,
        };
        let msg = err.to_string();
        assert!(msg.contains("item 3"));
        assert!(msg.contains("lib/a.o"));
        assert!(msg.contains("0xdeadbeef"));
        assert_eq!(err.item_index(), Some(3));
        assert_eq!(err.outcome(), Some(ItemOutcome::CrcError));
    }

    #[test]
    fn test_wrong_password() {
        let err = Error::WrongPassword {
            item_index: Some(7),
        };
        assert_eq!(err.to_string(), "Wrong password for item 7");
        assert!(err.is_encryption_error());
        assert_eq!(err.outcome(), Some(ItemOutcome::WrongPassword));

        let err = Error::WrongPassword { item_index: None };
        assert_eq!(err.to_string(), "Wrong password");
    }

    #[test]
    fn test_password_required() {
        let err = Error::PasswordRequired;
        assert!(err.is_encryption_error());
        assert_eq!(err.outcome(), Some(ItemOutcome::PasswordRequired));
    }

    #[test]
    fn test_fatal_errors_have_no_outcome() {
        assert_eq!(Error::Cancelled.outcome(), None);
        assert_eq!(Error::limit("item size", 10, 5).outcome(), None);
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.outcome(), None);
    }

    #[test]
    fn test_invalid_data_io_maps_to_data_error() {
        let err: Error = io::Error::new(io::ErrorKind::InvalidData, "bad stream").into();
        assert_eq!(err.outcome(), Some(ItemOutcome::DataError));
        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err.outcome(), Some(ItemOutcome::UnexpectedEnd));
    }

    #[test]
    fn test_limit_message() {
        let err = Error::limit("name table", 2048, 1024);
        assert_eq!(
            err.to_string(),
            "Resource limit exceeded: name table 2048 exceeds limit 1024"
        );
    }

    #[test]
    fn test_round_trip_through_io_error() {
        let io_err: io::Error = Error::data("bad block").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(Error::from_io(io_err), Error::DataError(_)));

        let io_err: io::Error = Error::UnexpectedEnd { offset: 9 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(Error::from_io(plain), Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}

//! Classified failures of pack and unpack runs.
//!
//! Everything is passed around as `anyhow::Error`. Failures which need a
//! specific classification are raised as [`KavachError`], plain I/O errors
//! are classified by looking at the error chain.

use std::path::PathBuf;

use anyhow::Error;

#[derive(thiserror::Error, Debug)]
pub enum KavachError {
    #[error("not a packed instance (signature {found:#018x})")]
    NotPacked { found: u64 },

    #[error("invalid host image: {0}")]
    InvalidImage(String),

    #[error("reserved section '{0}' not found in host image")]
    MissingSection(String),

    #[error("unbalanced file header table: {0}")]
    Unbalanced(String),

    #[error("payload size mismatch (tracked {tracked} bytes, wrote {written} bytes)")]
    PayloadMismatch { tracked: u64, written: u64 },

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("{0:?} is encrypted but no key was supplied")]
    MissingKey(PathBuf),

    #[error("destination {0:?} already exists")]
    DestinationExists(PathBuf),

    #[error("refusing to archive entry named {0:?}")]
    ReservedName(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// open/read/write/stat/seek failures
    Io,
    /// the archive or host image is not what it claims to be
    Format,
    /// the request itself cannot be honored
    Policy,
}

impl ErrorClass {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Io => 10,
            ErrorClass::Format => 11,
            ErrorClass::Policy => 12,
        }
    }
}

impl KavachError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KavachError::NotPacked { .. }
            | KavachError::InvalidImage(_)
            | KavachError::MissingSection(_)
            | KavachError::Unbalanced(_)
            | KavachError::PayloadMismatch { .. }
            | KavachError::Malformed(_) => ErrorClass::Format,
            KavachError::MissingKey(_)
            | KavachError::DestinationExists(_)
            | KavachError::ReservedName(_) => ErrorClass::Policy,
        }
    }
}

/// Classify an error by the first classified cause found in its chain.
///
/// Anything unclassified is an I/O failure, as that is the only other way
/// pack and unpack fail.
pub fn error_class(err: &Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<KavachError>())
        .map(KavachError::class)
        .unwrap_or(ErrorClass::Io)
}

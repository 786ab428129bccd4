//! Self extracting archives appended to ELF executables.
//!
//! [`pack`] walks a file or directory tree, appends the resulting archive to
//! a copy of the running executable and marks the copy as packed. Running
//! such a copy with [`unpack`] restores the tree next to it.
//!
//! The on-disk structures live in the `kavach-format` crate.

pub mod archive;
pub mod cipher;
pub mod config;
pub mod error;
pub mod host;
pub mod pack;
pub mod unpack;

pub use config::{KavachContext, PackOptions, UnpackOptions};
pub use error::{error_class, ErrorClass, KavachError};
pub use pack::pack;
pub use unpack::{list_archive, unpack, ArchiveListing};

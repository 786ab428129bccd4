//! *kavach* binary format (kbf) definition
//!
//! A packed executable is a copy of the host image up to the end of its
//! section header table, followed by the archive body:
//!
//! ```text
//!  [ host image: 0 .. structural end )
//!  [ KavachHeader ]                       -- fixed size
//!  [ FileHeader ] * fhnum                 -- fixed size each, includes end markers
//!  [ payload ]                            -- payloadsz bytes of file contents
//!  [ name table ]                         -- NUL terminated base names
//! ```
//!
//! All values are stored in host byte order. Offsets inside the
//! `KavachHeader` are relative to the start of the header itself, so the
//! archive body can be appended behind any host image.
//!
//! The file header table is a preorder serialization of the packed tree.
//! Every `Directory` record is followed by the records of its children
//! and a single all-zero record (`FileType::Undefined`) closing it.

use anyhow::{bail, Error};
use endian_trait::Endian;

pub mod elf;

/// Written at `SIGNATURE_OFFSET` (inside `e_ident` padding) of every
/// executable that carries an archive.
pub const PACK_SIGNATURE: u64 = 0x4c41_444e_554b_0000;
pub const SIGNATURE_OFFSET: u64 = 8;

/// Name of the section header slot which gets repurposed to describe the
/// appended archive body.
pub const KAVACH_SECTION_NAME: &[u8] = b".kavach";

/// Extension of generated self extracting executables.
pub const FILE_EXTENSION: &str = "kgs";

/// Appended to the executable's stem to name the extraction directory.
pub const UNPACK_DIR_SUFFIX: &str = ".unpacked";

#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct KavachHeader {
    /// Offset of the first file header.
    pub fhtoff: u64,
    /// Number of records in the file header table, including end markers.
    pub fhnum: u64,
    /// Size of a single file header record.
    pub fhentsize: u64,
    /// Offset of the name table.
    pub nametaboff: u64,
    /// Offset of the payload.
    pub payloadoff: u64,
    /// Total size of the payload.
    pub payloadsz: u64,
}
proxmox_lang::static_assert_size!(KavachHeader, 48);

pub const HEADER_SIZE: u64 = std::mem::size_of::<KavachHeader>() as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    /// End of the current directory.
    Undefined = 0,
    File = 1,
    Directory = 2,
}

impl TryFrom<u32> for FileType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        Ok(match value {
            0 => FileType::Undefined,
            1 => FileType::File,
            2 => FileType::Directory,
            other => bail!("unknown file type {}", other),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum CipherKind {
    /// archive only
    #[default]
    None = 0,
    Xor = 1,
}

impl TryFrom<u32> for CipherKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        Ok(match value {
            0 => CipherKind::None,
            1 => CipherKind::Xor,
            other => bail!("unknown cipher kind {}", other),
        })
    }
}

impl std::str::FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "none" => CipherKind::None,
            "xor" => CipherKind::Xor,
            other => bail!("unsupported encryption type '{}'", other),
        })
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CipherKind::None => f.write_str("none"),
            CipherKind::Xor => f.write_str("xor"),
        }
    }
}

/// An entry of the file header table.
///
/// `offset` is relative to the start of the payload and only meaningful for
/// files. `etype` is always `CipherKind::None` for directories.
#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FileHeader {
    pub namendx: u64,
    pub offset: u64,
    pub ftype: u32,
    pub etype: u32,
    pub mode: u32,
    pub reserved: u32,
    pub size: u64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}
proxmox_lang::static_assert_size!(FileHeader, 72);

pub const FILE_HEADER_SIZE: u64 = std::mem::size_of::<FileHeader>() as u64;

impl FileHeader {
    /// The record closing a directory.
    pub fn end_marker() -> Self {
        Self::default()
    }

    pub fn is_dir_end(&self) -> bool {
        self.ftype == FileType::Undefined as u32
    }

    pub fn file_type(&self) -> Result<FileType, Error> {
        FileType::try_from(self.ftype)
    }

    pub fn cipher_kind(&self) -> Result<CipherKind, Error> {
        CipherKind::try_from(self.etype)
    }

    /// Permission bits (including setuid/setgid/sticky) without the file type.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_marker_is_all_zero() {
        let marker = FileHeader::end_marker();
        assert!(marker.is_dir_end());
        assert_eq!(marker.file_type().unwrap(), FileType::Undefined);
        assert_eq!(marker.cipher_kind().unwrap(), CipherKind::None);
        assert_eq!(marker, FileHeader::default());
    }

    #[test]
    fn cipher_kind_names() {
        assert_eq!("xor".parse::<CipherKind>().unwrap(), CipherKind::Xor);
        assert_eq!("none".parse::<CipherKind>().unwrap(), CipherKind::None);
        assert!("aes".parse::<CipherKind>().is_err());
        assert_eq!(CipherKind::Xor.to_string(), "xor");
    }

    #[test]
    fn unknown_discriminants_are_rejected() {
        assert!(FileType::try_from(3).is_err());
        assert!(CipherKind::try_from(7).is_err());
        assert_eq!(FileType::try_from(2).unwrap(), FileType::Directory);
    }

    #[test]
    fn permissions_strip_file_type() {
        let header = FileHeader {
            mode: 0o100644,
            ..FileHeader::default()
        };
        assert_eq!(header.permissions(), 0o644);
    }
}

//! Archive construction, serialization and extraction.
//!
//! Packing walks the target tree depth first and builds an [`ArchiveObject`]
//! in memory: the file header table, the file contents and the name table.
//! The object is then appended to a copy of the host image in one go.
//!
//! Extraction never rebuilds the tree. It replays the file header table in
//! stored order against a stack of open directory handles: a directory
//! record pushes, an end marker pops, and a file lands in whatever
//! directory is on top.

use kavach_format::{FileHeader, FileType};

pub(crate) mod create;
pub(crate) mod dir_stack;
pub(crate) mod extract;
pub(crate) mod metadata;
pub(crate) mod name_table;
pub(crate) mod reader;
pub(crate) mod writer;

pub use create::create_archive;
pub use extract::{extract_archive, ExtractStats};
pub use name_table::NameTable;
pub use reader::{format_single_line_entry, ArchiveEntry, ArchiveReader};
pub use writer::{write_archive, WriteResult};

/// A fully built archive, ready to be written.
#[derive(Debug, Default)]
pub struct ArchiveObject {
    pub fht: Vec<FileHeader>,
    /// File contents in file header order, possibly scrambled.
    pub payload: Vec<Vec<u8>>,
    pub nametab: NameTable,
    /// Payload size as accounted while walking the tree.
    pub payload_size: u64,
}

impl ArchiveObject {
    pub fn file_count(&self) -> usize {
        self.count(FileType::File)
    }

    pub fn dir_count(&self) -> usize {
        self.count(FileType::Directory)
    }

    fn count(&self, kind: FileType) -> usize {
        self.fht
            .iter()
            .filter(|header| header.ftype == kind as u32)
            .count()
    }
}

/// Check that directory records and end markers nest properly.
///
/// Every prefix must close at most as many directories as it opened, and
/// the whole table must close all of them. Only the last record may bring
/// the depth back to zero.
pub fn check_balance(fht: &[FileHeader]) -> Result<(), crate::error::KavachError> {
    use crate::error::KavachError;

    let mut depth: u64 = 0;
    for (index, header) in fht.iter().enumerate() {
        if header.is_dir_end() {
            depth = depth.checked_sub(1).ok_or_else(|| {
                KavachError::Unbalanced(format!("record {} closes a directory never opened", index))
            })?;
        } else if header.ftype == FileType::Directory as u32 {
            depth += 1;
        }

        // the root record (and its end marker) must span the whole table
        if depth == 0 && index + 1 < fht.len() {
            return Err(KavachError::Unbalanced(format!(
                "record {} follows the end of the archive root",
                index + 1
            )));
        }
    }

    if depth != 0 {
        return Err(KavachError::Unbalanced(format!(
            "{} directories are never closed",
            depth
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> FileHeader {
        FileHeader {
            ftype: FileType::Directory as u32,
            ..FileHeader::default()
        }
    }

    fn file() -> FileHeader {
        FileHeader {
            ftype: FileType::File as u32,
            ..FileHeader::default()
        }
    }

    #[test]
    fn balanced_tables() {
        let end = FileHeader::end_marker();
        check_balance(&[]).unwrap();
        check_balance(&[file()]).unwrap();
        check_balance(&[dir(), end]).unwrap();
        check_balance(&[dir(), file(), dir(), file(), end, end]).unwrap();
    }

    #[test]
    fn unbalanced_tables() {
        let end = FileHeader::end_marker();
        assert!(check_balance(&[end]).is_err());
        assert!(check_balance(&[dir()]).is_err());
        assert!(check_balance(&[dir(), end, end, dir()]).is_err());
        assert!(check_balance(&[dir(), dir(), end]).is_err());
        assert!(check_balance(&[dir(), end, file()]).is_err());
        assert!(check_balance(&[dir(), end, dir(), end]).is_err());
        assert!(check_balance(&[file(), file()]).is_err());
    }
}

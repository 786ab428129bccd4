//! Replaying a file header table into a directory.

use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use anyhow::{Context, Error};
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use kavach_format::{CipherKind, FileHeader, FileType};

use super::dir_stack::KavachDirStack;
use super::{metadata, ArchiveReader};
use crate::cipher;
use crate::error::KavachError;

/// What an extraction run created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

struct Extractor<'r, 'a> {
    reader: &'r ArchiveReader<'a>,
    key: &'r [u8],
    dir_stack: KavachDirStack,
    stats: ExtractStats,
}

/// Extract the archive below `root`.
///
/// Records are processed in stored order: directory records descend into
/// a newly created directory, end markers return to its parent and apply
/// its metadata. Fails before creating anything if the archive holds
/// scrambled files and no key was given.
pub fn extract_archive(
    reader: &ArchiveReader,
    root: Dir,
    key: Option<&str>,
) -> Result<ExtractStats, Error> {
    reader.require_key(key)?;
    let key = key.unwrap_or_default().as_bytes();

    let mut extractor = Extractor {
        reader,
        key,
        dir_stack: KavachDirStack::new(root)?,
        stats: ExtractStats::default(),
    };

    for (index, record) in reader.records().iter().enumerate() {
        extractor
            .extract_record(record)
            .with_context(|| format!("failed to extract record {}", index))?;
    }

    if extractor.dir_stack.len() != 1 {
        return Err(KavachError::Unbalanced(format!(
            "{} directories left open after the last record",
            extractor.dir_stack.len() - 1
        ))
        .into());
    }

    Ok(extractor.stats)
}

impl<'r, 'a> Extractor<'r, 'a> {
    fn extract_record(&mut self, record: &FileHeader) -> Result<(), Error> {
        match record.file_type()? {
            FileType::Undefined => self.leave_directory(),
            FileType::Directory => self.enter_directory(record),
            FileType::File => self.extract_file(record),
        }
    }

    fn file_name(&self, record: &FileHeader) -> Result<&'a [u8], Error> {
        let name = self.reader.name(record)?;
        super::name_table::check_name(name)?;
        Ok(name)
    }

    fn enter_directory(&mut self, record: &FileHeader) -> Result<(), Error> {
        let name = self.file_name(record)?;
        self.dir_stack
            .push(OsStr::from_bytes(name).to_owned(), *record)?;
        self.stats.dirs += 1;
        Ok(())
    }

    fn leave_directory(&mut self) -> Result<(), Error> {
        let path_info = self.dir_stack.path().to_owned();

        if self.dir_stack.len() <= 1 {
            return Err(
                KavachError::Unbalanced("end marker without directory".to_string()).into(),
            );
        }
        let dir = self.dir_stack.pop()?;
        dir.finish(&path_info)?;

        log::debug!("extracted directory {:?}", path_info);
        Ok(())
    }

    fn extract_file(&mut self, record: &FileHeader) -> Result<(), Error> {
        let name = self.file_name(record)?;
        let path_info = self.dir_stack.path().join(OsStr::from_bytes(name));
        let c_name = CString::new(name)?;

        let kind = record.cipher_kind()?;
        if kind != CipherKind::None && self.key.is_empty() {
            return Err(KavachError::MissingKey(path_info).into());
        }

        let mut data = self.reader.payload(record)?.to_vec();
        cipher::scramble(kind, &mut data, self.key);

        let parent = self.dir_stack.last_dir_fd()?;
        let mut file = unsafe {
            File::from_raw_fd(
                nix::fcntl::openat(
                    parent,
                    c_name.as_c_str(),
                    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                    Mode::S_IRUSR | Mode::S_IWUSR,
                )
                .with_context(|| format!("failed to create file {:?}", path_info))?,
            )
        };

        file.write_all(&data)
            .with_context(|| format!("failed to write {:?}", path_info))?;

        metadata::apply(record, file.as_raw_fd(), &path_info)?;

        self.stats.files += 1;
        self.stats.bytes += record.size;
        log::debug!("extracted {:?} ({} bytes)", path_info, record.size);

        Ok(())
    }
}

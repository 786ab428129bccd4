//! Validated view of an archive body.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::Error;

use proxmox_io::ReadExt;

use kavach_format::{CipherKind, FileHeader, FileType, KavachHeader, FILE_HEADER_SIZE, HEADER_SIZE};

use super::check_balance;
use super::name_table::{check_name, name_at};
use crate::error::KavachError;

fn malformed<T>(msg: String) -> Result<T, Error> {
    Err(KavachError::Malformed(msg).into())
}

/// An archive body, parsed and checked for consistency.
///
/// Every offset and range stored in the archive is validated when the
/// reader is created, so accessors only fail on records from elsewhere.
pub struct ArchiveReader<'a> {
    header: KavachHeader,
    fht: Vec<FileHeader>,
    payload: &'a [u8],
    nametab: &'a [u8],
}

impl<'a> ArchiveReader<'a> {
    /// Parse the archive starting at `data[0]`.
    pub fn new(data: &'a [u8]) -> Result<Self, Error> {
        if (data.len() as u64) < HEADER_SIZE {
            return malformed(format!("archive too short ({} bytes)", data.len()));
        }
        let mut cursor = data;
        let header: KavachHeader = unsafe { cursor.read_host_value()? };
        log::debug!("archive header {:?}", header);

        let size = data.len() as u64;

        if header.fhentsize != FILE_HEADER_SIZE {
            return malformed(format!(
                "unexpected file header size {} (expected {})",
                header.fhentsize, FILE_HEADER_SIZE
            ));
        }
        let fht_end = header
            .fhnum
            .checked_mul(FILE_HEADER_SIZE)
            .and_then(|len| len.checked_add(header.fhtoff));
        let payload_end = header.payloadoff.checked_add(header.payloadsz);

        match (fht_end, payload_end) {
            (Some(fht_end), Some(payload_end))
                if header.fhtoff >= HEADER_SIZE
                    && header.fhtoff < header.payloadoff
                    && fht_end <= header.payloadoff
                    && payload_end <= header.nametaboff
                    && header.nametaboff <= size => {}
            _ => {
                return malformed(format!(
                    "inconsistent offsets (fht {} x{}, payload {}+{}, names {}, size {})",
                    header.fhtoff,
                    header.fhnum,
                    header.payloadoff,
                    header.payloadsz,
                    header.nametaboff,
                    size
                ))
            }
        }

        let mut fht = Vec::with_capacity(header.fhnum as usize);
        let mut reader = &data[header.fhtoff as usize..];
        for _ in 0..header.fhnum {
            fht.push(unsafe { reader.read_host_value::<FileHeader>()? });
        }

        let payload_start = header.payloadoff as usize;
        let this = Self {
            header,
            fht,
            payload: &data[payload_start..payload_start + header.payloadsz as usize],
            nametab: &data[header.nametaboff as usize..],
        };

        this.validate()?;
        Ok(this)
    }

    fn validate(&self) -> Result<(), Error> {
        check_balance(&self.fht)?;

        let mut file_total = 0u64;
        for (index, record) in self.fht.iter().enumerate() {
            let kind = match record.file_type() {
                Ok(kind) => kind,
                Err(err) => return malformed(format!("record {}: {}", index, err)),
            };
            if kind == FileType::Undefined {
                if *record != FileHeader::end_marker() {
                    return malformed(format!("record {}: end marker is not all zero", index));
                }
                continue;
            }
            if let Err(err) = record.cipher_kind() {
                return malformed(format!("record {}: {}", index, err));
            }
            let name = match name_at(self.nametab, record.namendx) {
                Ok(name) => name,
                Err(err) => return malformed(format!("record {}: {}", index, err)),
            };
            check_name(name).map_err(|err| {
                KavachError::Malformed(format!("record {}: {}", index, err))
            })?;

            if kind == FileType::File {
                self.payload_range(record).map_err(|err| {
                    KavachError::Malformed(format!("record {}: {}", index, err))
                })?;
                file_total += record.size;
            } else if record.etype != CipherKind::None as u32 {
                return malformed(format!("record {}: directory with cipher kind", index));
            }
        }

        if file_total != self.header.payloadsz {
            return Err(KavachError::PayloadMismatch {
                tracked: file_total,
                written: self.header.payloadsz,
            }
            .into());
        }

        Ok(())
    }

    pub fn header(&self) -> &KavachHeader {
        &self.header
    }

    pub fn records(&self) -> &[FileHeader] {
        &self.fht
    }

    pub fn name(&self, record: &FileHeader) -> Result<&'a [u8], Error> {
        name_at(self.nametab, record.namendx)
    }

    fn payload_range(&self, record: &FileHeader) -> Result<std::ops::Range<usize>, Error> {
        let end = record.offset.checked_add(record.size);
        match end {
            Some(end) if end <= self.payload.len() as u64 => {
                Ok(record.offset as usize..end as usize)
            }
            _ => anyhow::bail!(
                "payload range {}+{} exceeds payload of {} bytes",
                record.offset,
                record.size,
                self.payload.len()
            ),
        }
    }

    /// The stored (possibly scrambled) contents of a file record.
    pub fn payload(&self, record: &FileHeader) -> Result<&'a [u8], Error> {
        let range = self.payload_range(record)?;
        Ok(&self.payload[range])
    }

    /// The first file record which needs a key to be restored.
    pub fn first_encrypted(&self) -> Option<&FileHeader> {
        self.fht.iter().find(|record| {
            record.ftype == FileType::File as u32 && record.etype != CipherKind::None as u32
        })
    }

    /// Fail with [`KavachError::MissingKey`] if restoring needs a key and
    /// none (or an empty one) was given.
    pub fn require_key(&self, key: Option<&str>) -> Result<(), Error> {
        if !key.unwrap_or_default().is_empty() {
            return Ok(());
        }
        if let Some(record) = self.first_encrypted() {
            let name = self.name(record)?;
            return Err(KavachError::MissingKey(PathBuf::from(OsStr::from_bytes(name))).into());
        }
        Ok(())
    }

    /// Iterate over all entries with their paths relative to the archive.
    pub fn entries(&self) -> Entries<'_, 'a> {
        Entries {
            reader: self,
            index: 0,
            path: PathBuf::new(),
        }
    }
}

/// A file or directory stored in an archive.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    /// Path including the archive's root name.
    pub path: PathBuf,
    pub header: FileHeader,
    /// Nesting level, 0 for the root.
    pub depth: usize,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.header.ftype == FileType::Directory as u32
    }
}

#[rustfmt::skip]
fn symbolic_mode(c: u32, special: bool, special_x: u8, special_no_x: u8) -> [u8; 3] {
    [
        if 0 != c & 4 { b'r' } else { b'-' },
        if 0 != c & 2 { b'w' } else { b'-' },
        match (c & 1, special) {
            (0, false) => b'-',
            (0, true) => special_no_x,
            (_, false) => b'x',
            (_, true) => special_x,
        }
    ]
}

fn mode_string(entry: &ArchiveEntry) -> String {
    let mode = entry.header.mode;
    let type_char = if entry.is_dir() { 'd' } else { '-' };

    let fmt_u = symbolic_mode((mode >> 6) & 7, 0 != mode & libc::S_ISUID, b's', b'S');
    let fmt_g = symbolic_mode((mode >> 3) & 7, 0 != mode & libc::S_ISGID, b's', b'S');
    let fmt_o = symbolic_mode(mode & 7, 0 != mode & libc::S_ISVTX, b't', b'T');

    format!(
        "{}{}{}{}",
        type_char,
        String::from_utf8_lossy(&fmt_u),
        String::from_utf8_lossy(&fmt_g),
        String::from_utf8_lossy(&fmt_o),
    )
}

fn format_mtime(header: &FileHeader) -> String {
    if let Ok(s) = proxmox_time::strftime_local("%Y-%m-%d %H:%M:%S", header.mtime_sec) {
        return s;
    }
    format!("{}.{}", header.mtime_sec, header.mtime_nsec)
}

/// `ls -l` like description of an entry.
pub fn format_single_line_entry(entry: &ArchiveEntry) -> String {
    let cipher = match entry.header.cipher_kind() {
        Ok(kind) => kind.to_string(),
        Err(_) => "?".to_string(),
    };

    format!(
        "{} {} {:>8} {:<4} {:?}",
        mode_string(entry),
        format_mtime(&entry.header),
        entry.header.size,
        cipher,
        entry.path,
    )
}

pub struct Entries<'r, 'a> {
    reader: &'r ArchiveReader<'a>,
    index: usize,
    path: PathBuf,
}

impl<'r, 'a> Iterator for Entries<'r, 'a> {
    type Item = Result<ArchiveEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let header = *self.reader.fht.get(self.index)?;
            self.index += 1;

            if header.is_dir_end() {
                self.path.pop();
                continue;
            }

            let name = match self.reader.name(&header) {
                Ok(name) => name,
                Err(err) => return Some(Err(err)),
            };
            let depth = self.path.components().count();
            let path = self.path.join(OsStr::from_bytes(name));
            if header.ftype == FileType::Directory as u32 {
                self.path = path.clone();
            }

            return Some(Ok(ArchiveEntry {
                path,
                header,
                depth,
            }));
        }
    }
}

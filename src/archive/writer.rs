//! Serialization of an [`ArchiveObject`] behind a host image.

use std::io::{Seek, SeekFrom, Write};

use anyhow::{Context, Error};

use proxmox_io::WriteExt;

use kavach_format::{KavachHeader, FILE_HEADER_SIZE, HEADER_SIZE};

use super::ArchiveObject;
use crate::error::KavachError;

#[derive(Clone, Copy, Debug)]
pub struct WriteResult {
    pub header: KavachHeader,
    /// Size of the archive body, from the start of the header to the end
    /// of the name table.
    pub archive_size: u64,
}

/// Write `object` starting at offset `host_size` of `out`.
///
/// The header is written last, once all offsets are known. Fails with a
/// format error if the payload written differs from the payload size
/// accounted while building the object.
pub fn write_archive<W: Write + Seek>(
    out: &mut W,
    host_size: u64,
    object: &ArchiveObject,
) -> Result<WriteResult, Error> {
    let fhtoff = HEADER_SIZE;
    out.seek(SeekFrom::Start(host_size + fhtoff))
        .context("unable to seek to file header table")?;

    for header in &object.fht {
        unsafe { out.write_host_value(*header) }.context("unable to write file header")?;
    }

    let payloadoff = out.stream_position()? - host_size;

    let mut written = 0u64;
    for data in &object.payload {
        out.write_all(data).context("unable to write payload")?;
        written += data.len() as u64;
    }
    if written != object.payload_size {
        return Err(KavachError::PayloadMismatch {
            tracked: object.payload_size,
            written,
        }
        .into());
    }

    let nametaboff = out.stream_position()? - host_size;
    out.write_all(object.nametab.as_bytes())
        .context("unable to write name table")?;
    let archive_size = out.stream_position()? - host_size;

    let header = KavachHeader {
        fhtoff,
        fhnum: object.fht.len() as u64,
        fhentsize: FILE_HEADER_SIZE,
        nametaboff,
        payloadoff,
        payloadsz: written,
    };

    out.seek(SeekFrom::Start(host_size))
        .context("unable to seek to archive header")?;
    unsafe { out.write_host_value(header) }.context("unable to write archive header")?;
    out.seek(SeekFrom::Start(host_size + archive_size))?;
    out.flush()?;

    log::debug!("wrote archive header {:?}", header);

    Ok(WriteResult {
        header,
        archive_size,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use kavach_format::{FileHeader, FileType};

    use super::*;
    use crate::archive::NameTable;
    use crate::error::{error_class, ErrorClass};

    fn sample_object() -> ArchiveObject {
        let mut nametab = NameTable::new();
        let root = FileHeader {
            namendx: nametab.push(b"root").unwrap(),
            ftype: FileType::Directory as u32,
            mode: 0o40755,
            ..FileHeader::default()
        };
        let file = FileHeader {
            namendx: nametab.push(b"a.txt").unwrap(),
            ftype: FileType::File as u32,
            mode: 0o100644,
            size: 5,
            ..FileHeader::default()
        };
        ArchiveObject {
            fht: vec![root, file, FileHeader::end_marker()],
            payload: vec![b"hello".to_vec()],
            nametab,
            payload_size: 5,
        }
    }

    #[test]
    fn layout_behind_host() {
        let host = vec![0x7fu8; 100];
        let mut out = Cursor::new(host.clone());
        let object = sample_object();

        let result = write_archive(&mut out, 100, &object).unwrap();
        let header = result.header;
        assert_eq!(header.fhtoff, HEADER_SIZE);
        assert_eq!(header.fhnum, 3);
        assert_eq!(header.fhentsize, FILE_HEADER_SIZE);
        assert_eq!(header.payloadoff, HEADER_SIZE + 3 * FILE_HEADER_SIZE);
        assert_eq!(header.payloadsz, 5);
        assert_eq!(header.nametaboff, header.payloadoff + 5);
        assert_eq!(result.archive_size, header.nametaboff + 11);

        let data = out.into_inner();
        assert_eq!(&data[..100], &host[..]);
        assert_eq!(data.len() as u64, 100 + result.archive_size);
        let payload = (100 + header.payloadoff) as usize;
        assert_eq!(&data[payload..payload + 5], b"hello");
        assert_eq!(&data[data.len() - 11..], b"root\0a.txt\0");
    }

    #[test]
    fn payload_mismatch_is_detected() {
        let mut object = sample_object();
        object.payload_size = 6;

        let mut out = Cursor::new(Vec::new());
        let err = write_archive(&mut out, 0, &object).unwrap_err();
        assert_eq!(error_class(&err), ErrorClass::Format);
    }

    #[test]
    fn empty_payload() {
        let mut nametab = NameTable::new();
        let root = FileHeader {
            namendx: nametab.push(b"empty").unwrap(),
            ftype: FileType::Directory as u32,
            ..FileHeader::default()
        };
        let object = ArchiveObject {
            fht: vec![root, FileHeader::end_marker()],
            payload: Vec::new(),
            nametab,
            payload_size: 0,
        };

        let mut out = Cursor::new(Vec::new());
        let result = write_archive(&mut out, 0, &object).unwrap();
        assert_eq!(result.header.payloadsz, 0);
        assert_eq!(result.header.payloadoff, result.header.nametaboff);
    }
}

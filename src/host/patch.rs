//! Section header table surgery.
//!
//! Tools like `strip` drop file contents which no section describes. After
//! appending an archive, the reserved `.kavach` slot of the section header
//! table is rewritten to cover the archive body, so it survives those tools.

use std::fs::File;

use anyhow::{bail, Error};

use proxmox_io::{ReadExt, WriteExt};

use kavach_format::elf::{self, Elf64Ehdr, Elf64Shdr};

use super::SharedMapping;
use crate::error::KavachError;

/// A parsed copy of an image's section header table.
pub struct SectionTable {
    /// file offset of each entry of `headers`
    offsets: Vec<u64>,
    headers: Vec<Elf64Shdr>,
    names: Vec<u8>,
}

fn read_at<T: endian_trait::Endian>(image: &[u8], offset: u64, what: &str) -> Result<T, Error> {
    let size = std::mem::size_of::<T>() as u64;
    match offset.checked_add(size) {
        Some(end) if end <= image.len() as u64 => (),
        _ => {
            return Err(KavachError::InvalidImage(format!(
                "{} at offset {} is out of bounds",
                what, offset
            ))
            .into())
        }
    }
    let mut reader = &image[offset as usize..];
    Ok(unsafe { reader.read_host_value::<T>()? })
}

impl SectionTable {
    pub fn parse(image: &[u8]) -> Result<Self, Error> {
        let ehdr: Elf64Ehdr = read_at(image, 0, "ELF header")?;
        if !ehdr.has_magic() || u64::from(ehdr.e_shentsize) != elf::SHDR_SIZE {
            return Err(KavachError::InvalidImage("bad ELF header".to_string()).into());
        }

        let mut offsets = Vec::with_capacity(ehdr.e_shnum as usize);
        let mut headers = Vec::with_capacity(ehdr.e_shnum as usize);
        for index in 0..u64::from(ehdr.e_shnum) {
            let offset = (index * elf::SHDR_SIZE)
                .checked_add(ehdr.e_shoff)
                .ok_or_else(|| {
                    KavachError::InvalidImage(format!(
                        "section header {} offset overflows",
                        index
                    ))
                })?;
            headers.push(read_at::<Elf64Shdr>(image, offset, "section header")?);
            offsets.push(offset);
        }

        let strtab = headers
            .get(ehdr.e_shstrndx as usize)
            .filter(|_| ehdr.e_shstrndx != elf::SHN_UNDEF)
            .ok_or_else(|| {
                KavachError::InvalidImage("missing section name string table".to_string())
            })?;

        let start = strtab.sh_offset as usize;
        let end = strtab
            .sh_offset
            .checked_add(strtab.sh_size)
            .filter(|end| *end <= image.len() as u64)
            .ok_or_else(|| KavachError::InvalidImage("section names out of bounds".to_string()))?
            as usize;

        Ok(Self {
            offsets,
            headers,
            names: image[start..end].to_vec(),
        })
    }

    pub fn headers(&self) -> &[Elf64Shdr] {
        &self.headers
    }

    pub fn name_of(&self, index: usize) -> Option<&[u8]> {
        let header = self.headers.get(index)?;
        let name = self.names.get(header.sh_name as usize..)?;
        let len = name.iter().position(|b| *b == 0)?;
        Some(&name[..len])
    }

    pub fn find(&self, name: &[u8]) -> Option<usize> {
        (0..self.headers.len()).find(|index| self.name_of(*index) == Some(name))
    }

    /// Describe how the slot at `index` has to look to cover `size` bytes
    /// starting at `offset` as allocated raw data.
    pub fn archive_patch(&self, index: usize, offset: u64, size: u64) -> Result<SectionPatch, Error> {
        let (current, file_offset) = match (self.headers.get(index), self.offsets.get(index)) {
            (Some(current), Some(file_offset)) => (current, *file_offset),
            _ => bail!("no section header with index {}", index),
        };
        Ok(SectionPatch {
            file_offset,
            header: Elf64Shdr {
                sh_name: current.sh_name,
                sh_type: elf::SHT_PROGBITS,
                sh_flags: elf::SHF_ALLOC,
                sh_addr: 0,
                sh_offset: offset,
                sh_size: size,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        })
    }
}

/// A section header to be written at a given file offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionPatch {
    pub file_offset: u64,
    pub header: Elf64Shdr,
}

impl SectionPatch {
    pub fn apply(&self, image: &mut [u8]) -> Result<(), Error> {
        let end = match self.file_offset.checked_add(elf::SHDR_SIZE) {
            Some(end) if end <= image.len() as u64 => end as usize,
            _ => bail!("section header at offset {} is out of bounds", self.file_offset),
        };
        let mut out = &mut image[self.file_offset as usize..end];
        unsafe { out.write_host_value(self.header)? };
        Ok(())
    }
}

/// Point the reserved slot of the image in `file` at the archive body
/// `[host_size, host_size + archive_size)`.
pub fn patch_archive_section(
    file: &File,
    host_size: u64,
    archive_size: u64,
) -> Result<SectionPatch, Error> {
    let mut mapping = SharedMapping::map(file)?;

    let table = SectionTable::parse(mapping.data())?;
    let index = table.find(kavach_format::KAVACH_SECTION_NAME).ok_or_else(|| {
        KavachError::MissingSection(
            String::from_utf8_lossy(kavach_format::KAVACH_SECTION_NAME).into_owned(),
        )
    })?;

    let patch = table.archive_patch(index, host_size, archive_size)?;
    patch.apply(mapping.data_mut())?;

    log::debug!(
        "patched section header {} at offset {:#x}: {:?}",
        index,
        patch.file_offset,
        patch.header
    );

    Ok(patch)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::host::test_image;

    #[test]
    fn finds_slot_by_name() {
        let image = test_image::build(true);
        let table = SectionTable::parse(&image).unwrap();
        assert_eq!(table.headers().len(), 4);
        assert_eq!(table.find(b".kavach"), Some(3));
        assert_eq!(table.find(b".text"), Some(2));
        assert_eq!(table.find(b".shstrtab"), Some(1));
        assert_eq!(table.find(b".data"), None);
    }

    #[test]
    fn patch_rewrites_only_the_slot() {
        let mut image = test_image::build(true);
        let original = SectionTable::parse(&image).unwrap();
        let host_size = image.len() as u64;

        let patch = original.archive_patch(3, host_size, 1234).unwrap();
        patch.apply(&mut image).unwrap();

        let patched = SectionTable::parse(&image).unwrap();
        let slot = patched.headers()[3];
        assert_eq!(slot.sh_type, elf::SHT_PROGBITS);
        assert_eq!(slot.sh_flags, elf::SHF_ALLOC);
        assert_eq!(slot.sh_offset, host_size);
        assert_eq!(slot.sh_size, 1234);
        assert_eq!(slot.sh_addralign, 1);
        assert_eq!(slot.sh_link, 0);
        assert_eq!(patched.name_of(3), Some(&b".kavach"[..]));
        assert_eq!(&patched.headers()[..3], &original.headers()[..3]);

        assert!(original.archive_patch(4, host_size, 1234).is_err());
    }

    #[test]
    fn rejects_section_table_beyond_offset_range() {
        let mut image = test_image::build(true);
        // e_shoff lives at byte 40 of the ELF header
        image[40..48].copy_from_slice(&(u64::MAX - 100).to_ne_bytes());

        let err = SectionTable::parse(&image).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<KavachError>(),
            Some(KavachError::InvalidImage(_))
        ));

        let patch = SectionPatch {
            file_offset: u64::MAX - 10,
            header: Elf64Shdr::default(),
        };
        assert!(patch.apply(&mut image).is_err());
    }

    #[test]
    fn patch_through_shared_mapping() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image");
        let mut data = test_image::build(true);
        let host_size = data.len() as u64;
        data.extend_from_slice(&[0xaa; 100]);
        File::create(&path).unwrap().write_all(&data).unwrap();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        patch_archive_section(&file, host_size, 100).unwrap();
        drop(file);

        let data = std::fs::read(&path).unwrap();
        let table = SectionTable::parse(&data).unwrap();
        let slot = table.headers()[table.find(b".kavach").unwrap()];
        assert_eq!(slot.sh_offset, host_size);
        assert_eq!(slot.sh_size, 100);
    }

    #[test]
    fn missing_slot_is_a_format_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image");
        File::create(&path)
            .unwrap()
            .write_all(&test_image::build(false))
            .unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let err = patch_archive_section(&file, 0, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KavachError>(),
            Some(KavachError::MissingSection(_))
        ));
    }
}

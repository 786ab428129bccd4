//! The executable image carrying (or about to carry) an archive.
//!
//! The image size is taken from the ELF header instead of the file system:
//! the linker places the section header table last, so everything behind
//! `e_shoff + e_shnum * e_shentsize` is an appended archive. Packing from an
//! already packed instance therefore only ever copies the original host.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use proxmox_io::ReadExt;

use kavach_format::elf::{self, Elf64Ehdr};
use kavach_format::{PACK_SIGNATURE, SIGNATURE_OFFSET};

use crate::error::KavachError;

mod mmap;
mod patch;

pub use mmap::{ArchiveMapping, SharedMapping};
pub use patch::{patch_archive_section, SectionPatch, SectionTable};

pub struct HostImage {
    path: PathBuf,
    file: File,
    ehdr: Elf64Ehdr,
    structural_size: u64,
    file_size: u64,
}

impl HostImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("unable to open host image {:?}", path))?;

        let (ehdr, structural_size) = host_structural_size(&mut file)
            .with_context(|| format!("unable to size host image {:?}", path))?;

        let file_size = file.metadata()?.len();
        if file_size < structural_size {
            return Err(KavachError::InvalidImage(format!(
                "{:?} is truncated ({} < {} bytes)",
                path, file_size, structural_size
            ))
            .into());
        }

        Ok(Self {
            path: path.to_owned(),
            file,
            ehdr,
            structural_size,
            file_size,
        })
    }

    /// Open the executable of the running process.
    pub fn current() -> Result<Self, Error> {
        let path = std::env::current_exe().context("unable to locate own executable")?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn ehdr(&self) -> &Elf64Ehdr {
        &self.ehdr
    }

    /// Size of the host itself, i.e. where an appended archive starts.
    pub fn structural_size(&self) -> u64 {
        self.structural_size
    }

    /// Size of the file on disk, including any appended archive.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Permission bits of the image file.
    pub fn permissions(&self) -> Result<u32, Error> {
        Ok(self.file.metadata()?.permissions().mode() & 0o7777)
    }

    pub fn signature(&self) -> Result<u64, Error> {
        read_signature(&self.file)
    }

    /// Fail unless this image carries an archive.
    pub fn check_packed(&self) -> Result<(), Error> {
        let found = self.signature()?;
        if found != PACK_SIGNATURE {
            return Err(KavachError::NotPacked { found }.into());
        }
        Ok(())
    }
}

/// Compute the size of an ELF image from its own header.
///
/// Returns the parsed header along with the end offset of the section
/// header table. The reader is left positioned after the ELF header.
pub fn host_structural_size<R: Read>(reader: &mut R) -> Result<(Elf64Ehdr, u64), Error> {
    let ehdr: Elf64Ehdr = unsafe { reader.read_host_value()? };

    if !ehdr.has_magic() {
        return Err(KavachError::InvalidImage("missing ELF magic".to_string()).into());
    }
    if ehdr.e_ident[elf::EI_CLASS] != elf::ELFCLASS64 {
        return Err(KavachError::InvalidImage("not an ELF64 image".to_string()).into());
    }
    if ehdr.e_ident[elf::EI_DATA] != elf::ELFDATA_NATIVE {
        return Err(KavachError::InvalidImage("foreign byte order".to_string()).into());
    }
    if ehdr.e_shoff < elf::EHDR_SIZE || ehdr.e_shnum == 0 {
        return Err(KavachError::InvalidImage("no section header table".to_string()).into());
    }
    if u64::from(ehdr.e_shentsize) != elf::SHDR_SIZE {
        return Err(KavachError::InvalidImage(format!(
            "unexpected section header size {}",
            ehdr.e_shentsize
        ))
        .into());
    }

    let size = ehdr.section_table_end().ok_or_else(|| {
        KavachError::InvalidImage(format!("section header table offset {:#x} overflows", ehdr.e_shoff))
    })?;
    Ok((ehdr, size))
}

pub fn read_signature(file: &File) -> Result<u64, Error> {
    let mut buffer = [0u8; 8];
    file.read_exact_at(&mut buffer, SIGNATURE_OFFSET)
        .context("unable to read pack signature")?;
    Ok(u64::from_ne_bytes(buffer))
}

/// Mark an image as packed. Writing the signature again changes nothing.
pub fn inject_signature(file: &File) -> Result<(), Error> {
    file.write_all_at(&PACK_SIGNATURE.to_ne_bytes(), SIGNATURE_OFFSET)
        .context("unable to inject pack signature")
}

#[cfg(test)]
pub(crate) mod test_image {
    //! A minimal ELF64 image with a `.kavach` slot, laid out like linker
    //! output: headers and data first, section header table last.

    use kavach_format::elf::{self, Elf64Ehdr, Elf64Shdr};
    use proxmox_io::WriteExt;

    pub const SHSTRTAB: &[u8] = b"\0.shstrtab\0.kavach\0.text\0";

    pub fn build(with_slot: bool) -> Vec<u8> {
        let mut image = Vec::new();

        let text_offset = elf::EHDR_SIZE;
        let text = [0x90u8; 37];
        let strtab_offset = text_offset + text.len() as u64;
        let shoff = strtab_offset + SHSTRTAB.len() as u64;

        let mut sections = vec![
            Elf64Shdr::default(),
            Elf64Shdr {
                sh_name: 1,
                sh_type: elf::SHT_STRTAB,
                sh_offset: strtab_offset,
                sh_size: SHSTRTAB.len() as u64,
                sh_addralign: 1,
                ..Elf64Shdr::default()
            },
            Elf64Shdr {
                sh_name: 19,
                sh_type: elf::SHT_PROGBITS,
                sh_flags: elf::SHF_ALLOC,
                sh_offset: text_offset,
                sh_size: text.len() as u64,
                sh_addralign: 1,
                ..Elf64Shdr::default()
            },
        ];
        if with_slot {
            sections.push(Elf64Shdr {
                sh_name: 11,
                sh_type: elf::SHT_PROGBITS,
                sh_flags: elf::SHF_ALLOC,
                sh_offset: text_offset,
                sh_size: 8,
                sh_addralign: 8,
                ..Elf64Shdr::default()
            });
        }

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&elf::ELFMAG);
        e_ident[elf::EI_CLASS] = elf::ELFCLASS64;
        e_ident[elf::EI_DATA] = elf::ELFDATA_NATIVE;
        e_ident[6] = 1;

        let ehdr = Elf64Ehdr {
            e_ident,
            e_type: 3,
            e_version: 1,
            e_shoff: shoff,
            e_ehsize: elf::EHDR_SIZE as u16,
            e_shentsize: elf::SHDR_SIZE as u16,
            e_shnum: sections.len() as u16,
            e_shstrndx: 1,
            ..Elf64Ehdr::default()
        };

        unsafe { image.write_host_value(ehdr).unwrap() };
        image.extend_from_slice(&text);
        image.extend_from_slice(SHSTRTAB);
        for section in sections {
            unsafe { image.write_host_value(section).unwrap() };
        }
        image
    }
}

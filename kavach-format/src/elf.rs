//! The subset of the ELF64 file format needed to size and patch a host image.

use endian_trait::Endian;

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ELFDATA2MSB: u8 = 2;

#[cfg(target_endian = "little")]
pub const ELFDATA_NATIVE: u8 = ELFDATA2LSB;
#[cfg(target_endian = "big")]
pub const ELFDATA_NATIVE: u8 = ELFDATA2MSB;

pub const SHN_UNDEF: u16 = 0;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_STRTAB: u32 = 3;

pub const SHF_ALLOC: u64 = 0x2;

#[derive(Endian, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}
proxmox_lang::static_assert_size!(Elf64Ehdr, 64);

#[derive(Endian, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}
proxmox_lang::static_assert_size!(Elf64Shdr, 64);

pub const EHDR_SIZE: u64 = std::mem::size_of::<Elf64Ehdr>() as u64;
pub const SHDR_SIZE: u64 = std::mem::size_of::<Elf64Shdr>() as u64;

impl Elf64Ehdr {
    pub fn has_magic(&self) -> bool {
        self.e_ident[..4] == ELFMAG
    }

    /// End of the section header table, which is where the linker stops
    /// writing the file. `None` if it lies beyond the 64 bit offset range.
    pub fn section_table_end(&self) -> Option<u64> {
        self.e_shoff
            .checked_add(u64::from(self.e_shnum) * u64::from(self.e_shentsize))
    }
}

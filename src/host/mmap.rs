//! Memory mappings of host images.
//!
//! These are the only places where image files get mapped. Both mapping
//! types hand out plain slices, everything else works on those.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Error};
use nix::sys::mman::{MapFlags, ProtFlags};

use proxmox_sys::mmap::Mmap;

/// Read-only view of a file starting at an arbitrary offset.
///
/// `mmap()` wants page aligned offsets, so the mapping starts at the page
/// boundary at or before the requested offset and the remainder is skipped.
pub struct ArchiveMapping {
    map: Mmap<u8>,
    skip: usize,
}

impl ArchiveMapping {
    pub fn map(file: &File, start: u64, page_size: u64) -> Result<Self, Error> {
        let file_size = file.metadata()?.len();
        if start >= file_size {
            bail!("nothing to map at offset {} (file size {})", start, file_size);
        }

        let aligned = start - (start % page_size);
        let skip = (start - aligned) as usize;
        let len = (file_size - aligned) as usize;

        let map = unsafe {
            Mmap::<u8>::map_fd(
                file.as_raw_fd(),
                aligned,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
            )
        }
        .with_context(|| format!("unable to map {} bytes at offset {}", len, aligned))?;

        Ok(Self { map, skip })
    }

    /// The mapped bytes from the requested offset to the end of the file.
    pub fn data(&self) -> &[u8] {
        &self.map[self.skip..]
    }
}

/// Writable mapping of a whole file, shared with the file itself.
pub struct SharedMapping {
    map: Mmap<u8>,
}

impl SharedMapping {
    pub fn map(file: &File) -> Result<Self, Error> {
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            bail!("unable to map empty file");
        }

        let map = unsafe {
            Mmap::<u8>::map_fd(
                file.as_raw_fd(),
                0,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .with_context(|| format!("unable to map {} bytes for writing", len))?;

        Ok(Self { map })
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

//! Flat table of NUL terminated base names, referenced by byte offset.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::{bail, Error};

use crate::error::KavachError;

#[derive(Clone, Debug, Default)]
pub struct NameTable {
    data: Vec<u8>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a base name, returning its offset.
    pub fn push(&mut self, name: &[u8]) -> Result<u64, Error> {
        check_name(name)?;
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(name);
        self.data.push(0);
        Ok(offset)
    }

    pub fn get(&self, offset: u64) -> Result<&[u8], Error> {
        name_at(&self.data, offset)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Make sure a name is a single, regular path component.
pub fn check_name(name: &[u8]) -> Result<(), Error> {
    if name == b"." || name == b".." {
        return Err(KavachError::ReservedName(PathBuf::from(OsStr::from_bytes(name))).into());
    }
    if name.is_empty() {
        bail!("empty file name");
    }
    if name.contains(&b'/') {
        bail!("file name {:?} contains slashes", OsStr::from_bytes(name));
    }
    if name.contains(&0) {
        bail!("file name {:?} contains null bytes", OsStr::from_bytes(name));
    }
    Ok(())
}

/// Look up the name stored at `offset` of a raw name table.
pub fn name_at(table: &[u8], offset: u64) -> Result<&[u8], Error> {
    let start = match usize::try_from(offset) {
        Ok(start) if start < table.len() => start,
        _ => bail!("name offset {} out of range ({} bytes)", offset, table.len()),
    };
    let rest = &table[start..];
    match rest.iter().position(|b| *b == 0) {
        Some(len) => Ok(&rest[..len]),
        None => bail!("name at offset {} is not nul terminated", offset),
    }
}

//! Run configuration.
//!
//! Everything a pack or unpack run needs to know about its environment is
//! collected once into a [`KavachContext`] and passed down explicitly.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use nix::unistd::{sysconf, SysconfVar};

use kavach_format::CipherKind;

use crate::host::HostImage;

pub struct KavachContext {
    page_size: u64,
    image: HostImage,
}

impl KavachContext {
    pub fn new(image: HostImage) -> Result<Self, Error> {
        Ok(Self {
            page_size: page_size()?,
            image,
        })
    }

    /// Context for the executable of the running process.
    pub fn current() -> Result<Self, Error> {
        Self::new(HostImage::current()?)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn image(&self) -> &HostImage {
        &self.image
    }

    /// Size of the host image without any appended archive.
    pub fn host_size(&self) -> u64 {
        self.image.structural_size()
    }
}

fn page_size() -> Result<u64, Error> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as u64),
        Ok(_) => Err(format_err!("unable to determine page size")),
        Err(err) => Err(format_err!("sysconf(PAGE_SIZE) failed - {}", err)),
    }
}

/// Options of a single pack run.
#[derive(Clone, Debug)]
pub struct PackOptions {
    /// File or directory to archive.
    pub target: PathBuf,
    /// Output name, without the `.kgs` extension.
    pub output: PathBuf,
    pub cipher: CipherKind,
    pub key: Option<String>,
    /// Remove `target` after a successful pack.
    pub destroy_relics: bool,
}

impl PackOptions {
    pub fn new<P: AsRef<Path>>(target: P) -> Self {
        let target = target.as_ref().to_owned();
        let output = default_output_name(&target);
        Self {
            target,
            output,
            cipher: CipherKind::None,
            key: None,
            destroy_relics: false,
        }
    }
}

fn default_output_name(target: &Path) -> PathBuf {
    target
        .canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(target)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("kavach"))
}

/// Options of a single unpack run.
#[derive(Clone, Debug, Default)]
pub struct UnpackOptions {
    pub key: Option<String>,
    /// Directory in which the extraction directory gets created.
    pub target_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_defaults_to_target_name() {
        let options = PackOptions::new("/nonexistent/some/dir");
        assert_eq!(options.output, PathBuf::from("dir"));
        assert_eq!(options.cipher, CipherKind::None);
        assert!(!options.destroy_relics);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size().unwrap();
        assert!(size.is_power_of_two());
    }
}

//! Restoring the archive carried by a packed executable.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use kavach_format::{KavachHeader, UNPACK_DIR_SUFFIX};

use crate::archive::{extract_archive, ArchiveEntry, ArchiveReader};
use crate::config::{KavachContext, UnpackOptions};
use crate::error::KavachError;
use crate::host::ArchiveMapping;

/// Name of the directory an executable extracts into: its file name
/// without extension, followed by `.unpacked`.
pub fn unpack_dir_name(image: &Path) -> OsString {
    let mut name = image
        .file_stem()
        .map(OsStr::to_owned)
        .unwrap_or_else(|| OsString::from("kavach"));
    name.push(UNPACK_DIR_SUFFIX);
    name
}

/// Check the signature and map the archive body of the context's image.
fn map_archive(ctx: &KavachContext) -> Result<ArchiveMapping, Error> {
    let image = ctx.image();
    image.check_packed()?;

    if image.file_size() <= ctx.host_size() {
        return Err(KavachError::Malformed(format!(
            "no archive behind host image of {} bytes",
            ctx.host_size()
        ))
        .into());
    }

    ArchiveMapping::map(image.file(), ctx.host_size(), ctx.page_size())
        .context("unable to map archive")
}

/// Extract the archive carried by the context's image.
///
/// The destination directory must not exist yet. Returns its path.
pub fn unpack(ctx: &KavachContext, options: &UnpackOptions) -> Result<PathBuf, Error> {
    let mapping = map_archive(ctx)?;
    let reader = ArchiveReader::new(mapping.data())?;

    // before the destination exists, so a missing key leaves nothing behind
    let key = options.key.as_deref();
    reader.require_key(key)?;

    let dest = options
        .target_dir
        .as_deref()
        .unwrap_or_else(|| Path::new("."))
        .join(unpack_dir_name(ctx.image().path()));

    match nix::unistd::mkdir(&dest, Mode::from_bits_truncate(0o755)) {
        Ok(()) => (),
        Err(Errno::EEXIST) => return Err(KavachError::DestinationExists(dest).into()),
        Err(err) => {
            return Err(Error::from(err).context(format!("unable to create {:?}", dest)))
        }
    }

    let root = Dir::open(
        &dest,
        OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("unable to open {:?}", dest))?;

    let stats = extract_archive(&reader, root, key)
        .with_context(|| format!("unable to extract into {:?}", dest))?;

    log::info!(
        "extracted {} files in {} directories ({} bytes) into {:?}",
        stats.files,
        stats.dirs,
        stats.bytes,
        dest
    );

    Ok(dest)
}

/// Header and entries of a carried archive.
pub struct ArchiveListing {
    pub header: KavachHeader,
    pub entries: Vec<ArchiveEntry>,
}

/// List the archive carried by the context's image without extracting it.
pub fn list_archive(ctx: &KavachContext) -> Result<ArchiveListing, Error> {
    let mapping = map_archive(ctx)?;
    let reader = ArchiveReader::new(mapping.data())?;

    Ok(ArchiveListing {
        header: *reader.header(),
        entries: reader.entries().collect::<Result<_, _>>()?,
    })
}

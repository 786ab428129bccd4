//! Creating a self extracting executable.

use std::ffi::OsString;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use kavach_format::FILE_EXTENSION;

use crate::archive::{create_archive, write_archive, ArchiveObject};
use crate::config::{KavachContext, PackOptions};
use crate::error::KavachError;
use crate::host::{inject_signature, patch_archive_section};

/// The file name a pack run writes to: the output name with the `.kgs`
/// extension appended.
pub fn output_path(options: &PackOptions) -> PathBuf {
    let mut name = OsString::from(options.output.as_os_str());
    name.push(".");
    name.push(FILE_EXTENSION);
    PathBuf::from(name)
}

/// Pack `options.target` into a copy of the context's host image.
///
/// The archive is built completely in memory before the output file is
/// created. If anything fails after that, the incomplete output is
/// removed again. Returns the path of the new executable.
pub fn pack(ctx: &KavachContext, options: &PackOptions) -> Result<PathBuf, Error> {
    let object = create_archive(&options.target, options.cipher, options.key.as_deref())
        .with_context(|| format!("unable to archive {:?}", options.target))?;

    log::info!(
        "archived {} files in {} directories ({} bytes)",
        object.file_count(),
        object.dir_count(),
        object.payload_size
    );

    let path = output_path(options);
    let perms = ctx.image().permissions()?;

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(perms)
        .open(&path)
        .with_context(|| format!("unable to create {:?}", path))?;

    if let Err(err) = write_output(ctx, &mut out, perms, &object) {
        drop(out);
        if let Err(cleanup) = std::fs::remove_file(&path) {
            log::warn!("unable to remove incomplete output {:?} - {}", path, cleanup);
        }
        return Err(err.context(format!("unable to write {:?}", path)));
    }

    log::info!("created {:?}", path);

    if options.destroy_relics {
        destroy_relics(&options.target)?;
    }

    Ok(path)
}

fn write_output(
    ctx: &KavachContext,
    out: &mut File,
    perms: u32,
    object: &ArchiveObject,
) -> Result<(), Error> {
    // the mode given at creation is subject to the umask
    out.set_permissions(Permissions::from_mode(perms))?;

    let host_size = ctx.host_size();
    copy_host(ctx.image().file(), out, host_size)?;
    inject_signature(out)?;

    let result = write_archive(out, host_size, object)?;
    log::debug!(
        "archive body at offset {} ({} bytes)",
        host_size,
        result.archive_size
    );

    patch_archive_section(out, host_size, result.archive_size)?;
    out.sync_all().context("unable to sync output")?;

    Ok(())
}

/// Copy the first `host_size` bytes of the host image.
fn copy_host(host: &File, out: &mut File, host_size: u64) -> Result<(), Error> {
    let mut host = host.try_clone().context("unable to duplicate host image handle")?;
    host.seek(SeekFrom::Start(0))?;

    let copied = io::copy(&mut (&mut host).take(host_size), out)
        .context("unable to copy host image")?;
    if copied != host_size {
        return Err(KavachError::InvalidImage(format!(
            "host image ends after {} of {} bytes",
            copied, host_size
        ))
        .into());
    }

    Ok(())
}

/// Remove a pack target after it has been packed successfully.
pub fn destroy_relics(target: &Path) -> Result<(), Error> {
    let meta = std::fs::symlink_metadata(target)
        .with_context(|| format!("unable to stat {:?}", target))?;

    if meta.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    }
    .with_context(|| format!("unable to remove {:?}", target))?;

    log::info!("removed {:?}", target);
    Ok(())
}

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{Context, Error};
use nix::sys::stat::{fchmod, futimens, Mode};
use nix::sys::time::TimeSpec;

use kavach_format::FileHeader;

fn timestamps(header: &FileHeader) -> (TimeSpec, TimeSpec) {
    (
        TimeSpec::new(header.atime_sec as _, header.atime_nsec as _),
        TimeSpec::new(header.mtime_sec as _, header.mtime_nsec as _),
    )
}

pub fn perms_from_header(header: &FileHeader) -> Mode {
    Mode::from_bits_truncate(header.permissions() as libc::mode_t)
}

/// Restore mode and timestamps of an extracted entry.
///
/// Has to run after the contents are in place: writing a file or creating
/// entries in a directory updates its times, and the stored mode may not
/// allow either.
pub fn apply(header: &FileHeader, fd: RawFd, path_info: &Path) -> Result<(), Error> {
    fchmod(fd, perms_from_header(header))
        .with_context(|| format!("failed to change file mode of {:?}", path_info))?;

    let (atime, mtime) = timestamps(header);
    futimens(fd, &atime, &mtime)
        .with_context(|| format!("failed to restore timestamps of {:?}", path_info))?;

    Ok(())
}

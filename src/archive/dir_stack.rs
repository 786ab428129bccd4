use std::ffi::OsString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::{fstat, mkdirat, Mode};

use kavach_format::FileHeader;

use super::metadata;

/// Device and inode number of a directory.
type DirIdentity = (libc::dev_t, libc::ino_t);

fn dir_identity(dir: &Dir) -> Result<DirIdentity, Error> {
    let stat = fstat(dir.as_raw_fd())?;
    Ok((stat.st_dev, stat.st_ino))
}

/// An extracted directory whose metadata is still pending.
///
/// Only the directory currently being filled (and a directory just left)
/// holds an open handle.
pub struct KavachDir {
    file_name: OsString,
    header: Option<FileHeader>,
    identity: DirIdentity,
    dir: Option<Dir>,
}

impl KavachDir {
    /// Create `file_name` below `parent` and open it.
    ///
    /// The directory is created accessible to us only, its stored mode is
    /// applied when leaving it.
    fn create(parent: RawFd, file_name: OsString, header: FileHeader) -> Result<Self, Error> {
        mkdirat(parent, file_name.as_os_str(), Mode::S_IRWXU)
            .with_context(|| format!("failed to create directory {:?}", file_name))?;

        let dir = Dir::openat(
            parent,
            file_name.as_os_str(),
            OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("failed to open directory {:?}", file_name))?;

        Ok(Self {
            file_name,
            header: Some(header),
            identity: dir_identity(&dir)?,
            dir: Some(dir),
        })
    }

    pub fn file_name(&self) -> &OsString {
        &self.file_name
    }

    fn raw_fd(&self) -> Result<RawFd, Error> {
        self.dir
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| format_err!("directory {:?} is not open", self.file_name))
    }

    /// Restore the stored mode and timestamps. The extraction root has
    /// none and is left alone.
    pub fn finish(&self, path_info: &Path) -> Result<(), Error> {
        match &self.header {
            Some(header) => metadata::apply(header, self.raw_fd()?, path_info)
                .context("failed to apply directory metadata"),
            None => Ok(()),
        }
    }
}

/// The chain of directories from the extraction root down to the directory
/// currently being filled.
///
/// Ancestors are closed while their children are filled and reopened
/// through `..` when returning to them, so the nesting depth is not bound
/// by the file descriptor limit.
pub struct KavachDirStack {
    dirs: Vec<KavachDir>,
    path: PathBuf,
}

impl KavachDirStack {
    pub fn new(root: Dir) -> Result<Self, Error> {
        Ok(Self {
            dirs: vec![KavachDir {
                file_name: OsString::from("."),
                header: None,
                identity: dir_identity(&root).context("failed to stat extraction root")?,
                dir: Some(root),
            }],
            path: PathBuf::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Create a directory below the current one and make it current.
    pub fn push(&mut self, file_name: OsString, header: FileHeader) -> Result<(), Error> {
        let parent = self.last_dir_fd()?;
        let dir = KavachDir::create(parent, file_name, header)?;
        if let Some(parent) = self.dirs.last_mut() {
            parent.dir = None;
        }
        self.path.push(dir.file_name());
        self.dirs.push(dir);
        Ok(())
    }

    /// Leave the current directory and reopen its parent. The extraction
    /// root is never popped.
    ///
    /// The returned directory is still open, so its metadata can be applied.
    pub fn pop(&mut self) -> Result<KavachDir, Error> {
        if self.dirs.len() <= 1 {
            bail!("directory stack underrun");
        }
        let dir = match self.dirs.pop() {
            Some(dir) => dir,
            None => bail!("directory stack underrun"),
        };
        if !self.path.pop() {
            bail!("lost track of path");
        }

        let parent = Dir::openat(
            dir.raw_fd()?,
            "..",
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("failed to reopen parent of {:?}", dir.file_name))?;

        let current = self
            .dirs
            .last_mut()
            .context("lost track of parent directory")?;
        if dir_identity(&parent)? != current.identity {
            bail!("directory {:?} was moved during extraction", self.path);
        }
        current.dir = Some(parent);

        Ok(dir)
    }

    pub fn last_dir_fd(&self) -> Result<RawFd, Error> {
        self.dirs
            .last()
            .context("lost track of directory file descriptors")?
            .raw_fd()
    }

    /// Path of the current directory, relative to the extraction root.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Building an archive object from a file system tree.

use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use nix::dir::{Dir, Type};
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{FileStat, Mode};

use kavach_format::{CipherKind, FileHeader, FileType};

use super::{ArchiveObject, NameTable};
use crate::cipher;
use crate::error::KavachError;

struct FileListEntry {
    name: CString,
    path: PathBuf,
}

/// Device and inode number of a directory.
type DirIdentity = (libc::dev_t, libc::ino_t);

/// A directory which still has entries left to visit.
///
/// Only the innermost directory is kept open. Its ancestors are reopened
/// through `..` on the way back up and must still be the same directory.
struct DirFrame {
    identity: DirIdentity,
    entries: std::vec::IntoIter<FileListEntry>,
}

fn dir_identity(dir: &Dir) -> Result<DirIdentity, Error> {
    let stat = nix::sys::stat::fstat(dir.as_raw_fd())?;
    Ok((stat.st_dev, stat.st_ino))
}

fn open_parent(dir: &Dir, expected: DirIdentity) -> Result<Dir, Error> {
    let parent = Dir::openat(
        dir.as_raw_fd(),
        "..",
        OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    if dir_identity(&parent)? != expected {
        bail!("directory was moved while being archived");
    }
    Ok(parent)
}

struct Archiver {
    cipher: CipherKind,
    key: Vec<u8>,
    /// Path of the entry currently being archived, for error messages.
    path: PathBuf,
    fht: Vec<FileHeader>,
    payload: Vec<Vec<u8>>,
    nametab: NameTable,
    payload_offset: u64,
}

/// Walk `target` depth first and build the archive object describing it.
///
/// `cipher` is applied to every file's contents with `key`. Without a key
/// the archive is created unscrambled and records `CipherKind::None`.
///
/// Directory entries are visited in byte order of their names, so the same
/// tree always produces the same archive.
pub fn create_archive(
    target: &Path,
    cipher: CipherKind,
    key: Option<&str>,
) -> Result<ArchiveObject, Error> {
    let cipher = cipher::effective_kind(cipher, key);

    let mut archiver = Archiver {
        cipher,
        key: key.unwrap_or_default().as_bytes().to_vec(),
        path: target.to_owned(),
        fht: Vec::new(),
        payload: Vec::new(),
        nametab: NameTable::new(),
        payload_offset: 0,
    };

    archiver.archive_root(target).map_err(|err| archiver.wrap_err(err))?;

    Ok(ArchiveObject {
        fht: archiver.fht,
        payload: archiver.payload,
        nametab: archiver.nametab,
        payload_size: archiver.payload_offset,
    })
}

/// The name under which the root is stored. `.` and `..` are resolved to
/// the directory they refer to.
fn root_name(target: &Path) -> Result<Vec<u8>, Error> {
    let name = match target.file_name() {
        Some(name) => name.to_owned(),
        None => target
            .canonicalize()
            .with_context(|| format!("unable to resolve {:?}", target))?
            .file_name()
            .map(OsStr::to_owned)
            .ok_or_else(|| format_err!("refusing to archive the file system root"))?,
    };
    Ok(name.as_bytes().to_vec())
}

impl Archiver {
    fn wrap_err(&self, err: Error) -> Error {
        if err.downcast_ref::<KavachError>().is_some() {
            err
        } else {
            err.context(format!("error at {:?}", self.path))
        }
    }

    fn archive_root(&mut self, target: &Path) -> Result<(), Error> {
        let stat = nix::sys::stat::stat(target)
            .with_context(|| format!("stat {:?} failed", target))?;
        let name = root_name(target)?;

        match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG => {
                let file = File::open(target)
                    .with_context(|| format!("open file {:?} failed", target))?;
                self.add_regular_file(file, &name, &stat)
            }
            libc::S_IFDIR => {
                let dir = Dir::open(target, OFlag::O_DIRECTORY | OFlag::O_CLOEXEC, Mode::empty())
                    .with_context(|| format!("open dir {:?} failed", target))?;
                self.archive_tree(dir, &name, &stat)
            }
            _ => bail!("unsupported file type (mode {:o})", stat.st_mode),
        }
    }

    /// Archive a directory and everything below it.
    ///
    /// Recursion is replaced by an explicit stack of directory frames, so
    /// neither the call stack nor the number of open file descriptors
    /// limit the tree depth.
    fn archive_tree(&mut self, mut dir: Dir, name: &[u8], stat: &FileStat) -> Result<(), Error> {
        self.add_directory(name, stat)?;
        let entries = self.generate_directory_file_list(&mut dir)?;

        let mut stack = vec![DirFrame {
            identity: dir_identity(&dir)?,
            entries: entries.into_iter(),
        }];

        loop {
            let next = match stack.last_mut() {
                Some(frame) => frame.entries.next(),
                None => break,
            };

            let entry = match next {
                Some(entry) => entry,
                None => {
                    stack.pop();
                    self.fht.push(FileHeader::end_marker());
                    self.path.pop();
                    if let Some(frame) = stack.last() {
                        dir = open_parent(&dir, frame.identity)
                            .with_context(|| format!("unable to return to {:?}", self.path))?;
                    }
                    continue;
                }
            };

            let parent = dir.as_raw_fd();
            self.path = entry.path;
            let stat = nix::sys::stat::fstatat(
                parent,
                entry.name.as_c_str(),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )
            .with_context(|| format!("stat {:?} failed", self.path))?;

            match stat.st_mode & libc::S_IFMT {
                libc::S_IFREG => {
                    let file = open_file_at(parent, &entry.name, OFlag::O_RDONLY)
                        .with_context(|| format!("open file {:?} failed", self.path))?;
                    self.add_regular_file(file, entry.name.to_bytes(), &stat)?;
                    self.path.pop();
                }
                libc::S_IFDIR => {
                    let mut child = Dir::openat(
                        parent,
                        entry.name.as_c_str(),
                        OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                        Mode::empty(),
                    )
                    .with_context(|| format!("open dir {:?} failed", self.path))?;

                    self.add_directory(entry.name.to_bytes(), &stat)?;
                    let entries = self.generate_directory_file_list(&mut child)?;
                    stack.push(DirFrame {
                        identity: dir_identity(&child)?,
                        entries: entries.into_iter(),
                    });
                    dir = child;
                }
                _ => {
                    // replaced since listing, skip it like any other special file
                    log::debug!("skipping {:?} (mode {:o})", self.path, stat.st_mode);
                    self.path.pop();
                }
            }
        }

        Ok(())
    }

    /// List the regular files and directories in `dir`, sorted by name.
    fn generate_directory_file_list(&self, dir: &mut Dir) -> Result<Vec<FileListEntry>, Error> {
        let dir_fd = dir.as_raw_fd();
        let mut file_list = Vec::new();

        for entry in dir.iter() {
            let entry = entry.with_context(|| format!("readdir {:?} failed", self.path))?;
            let name = entry.file_name();
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }

            let file_type = match entry.file_type() {
                Some(file_type) => file_type,
                None => file_type_at(dir_fd, name)?,
            };

            let path = self.path.join(OsStr::from_bytes(bytes));
            match file_type {
                Type::File | Type::Directory => file_list.push(FileListEntry {
                    name: name.to_owned(),
                    path,
                }),
                _ => log::debug!("skipping {:?} (not a file or directory)", path),
            }
        }

        file_list.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        Ok(file_list)
    }

    fn header_from_stat(&self, stat: &FileStat, ftype: FileType) -> FileHeader {
        FileHeader {
            ftype: ftype as u32,
            mode: stat.st_mode as u32,
            size: if ftype == FileType::File {
                stat.st_size as u64
            } else {
                0
            },
            atime_sec: stat.st_atime as i64,
            atime_nsec: stat.st_atime_nsec as i64,
            mtime_sec: stat.st_mtime as i64,
            mtime_nsec: stat.st_mtime_nsec as i64,
            ..FileHeader::default()
        }
    }

    fn add_directory(&mut self, name: &[u8], stat: &FileStat) -> Result<(), Error> {
        let mut header = self.header_from_stat(stat, FileType::Directory);
        header.namendx = self.nametab.push(name)?;
        self.fht.push(header);
        Ok(())
    }

    fn add_regular_file(&mut self, mut file: File, name: &[u8], stat: &FileStat) -> Result<(), Error> {
        let mut header = self.header_from_stat(stat, FileType::File);
        header.namendx = self.nametab.push(name)?;
        header.etype = self.cipher as u32;
        header.offset = self.payload_offset;

        let size = usize::try_from(header.size)
            .map_err(|_| format_err!("file too large ({} bytes)", header.size))?;
        let mut data = vec![0u8; size];
        file.read_exact(&mut data).with_context(|| {
            format!("short read from {:?} (expected {} bytes)", self.path, size)
        })?;

        cipher::scramble(self.cipher, &mut data, &self.key);

        self.payload.push(data);
        self.payload_offset += header.size;
        self.fht.push(header);

        Ok(())
    }
}

fn file_type_at(dir_fd: RawFd, name: &CStr) -> Result<Type, Error> {
    let stat = nix::sys::stat::fstatat(dir_fd, name, AtFlags::AT_SYMLINK_NOFOLLOW)
        .with_context(|| format!("stat {:?} failed", name))?;
    Ok(match stat.st_mode & libc::S_IFMT {
        libc::S_IFREG => Type::File,
        libc::S_IFDIR => Type::Directory,
        libc::S_IFLNK => Type::Symlink,
        libc::S_IFIFO => Type::Fifo,
        libc::S_IFSOCK => Type::Socket,
        libc::S_IFCHR => Type::CharacterDevice,
        _ => Type::BlockDevice,
    })
}

fn open_file_at(parent: RawFd, name: &CStr, oflags: OFlag) -> Result<File, Error> {
    let fd = nix::fcntl::openat(
        parent,
        name,
        oflags | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

//! Mounted filesystem facade for the configuration store.
//!
//! [`Fs`] owns the backing [`Storage`] and every piece of runtime state: the
//! logical mount count, the rotating file-descriptor allocator and the
//! fixed-size handle table. Operations take `&mut self`; the embedding
//! firmware wraps the value in its platform mutex to serialize the main loop
//! and the housekeeping task.
//!
//! The first mount after flashing formats the storage; afterwards the mount
//! count is purely logical and open handles keep it pinned above zero. Every
//! public entry point validates its path (safety and depth) before any disk
//! I/O happens.

#![cfg_attr(not(test), no_std)]

delog::generate_macros!();

use littlefs2::driver::Storage;
use littlefs2::fs::Filesystem;
use littlefs2::io::{Error as LfsError, Read as _, Seek as _, SeekFrom, Write as _};
use littlefs2::path::{Path, PathBuf};

mod blocks;
pub mod path;

/// Directories may nest this many levels deep.
pub const MAX_DIR_DEPTH: usize = 3;
/// Files may sit one level below the deepest directory.
pub const MAX_FILE_DEPTH: usize = MAX_DIR_DEPTH + 1;
/// Maximum length of a single path segment.
pub const NAME_MAX: usize = 40;
/// Maximum number of concurrently open files and directories.
pub const MAX_OPEN_FDS: usize = 6;

/// Descriptors 0-3 are reserved so 0 can stay an invalid sentinel and 1-3
/// keep room for stdio-like conventions.
const FIRST_VALID_FD: u16 = 4;

/// Scratch size for the deepest legal path: four segments, separators, nul.
const PATH_BUF_LEN: usize = NAME_MAX * MAX_FILE_DEPTH + MAX_FILE_DEPTH;

type PathString = heapless::String<PATH_BUF_LEN>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Argument out of range, unsafe path, depth exceeded, unknown
    /// descriptor.
    Invalid,
    /// Flash or transport failure underneath the filesystem.
    Io,
    /// On-disk state violates an expected format.
    Corrupt,
    /// Descriptor table or filesystem blocks exhausted.
    Full,
    /// File absent; callers usually fall back to defaults.
    NotFound,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl From<LfsError> for Error {
    fn from(err: LfsError) -> Self {
        if err == LfsError::NoSuchEntry {
            Self::NotFound
        } else if err == LfsError::NoSpace || err == LfsError::NoMemory {
            Self::Full
        } else if err == LfsError::Corruption {
            Self::Corrupt
        } else if err == LfsError::Io {
            Self::Io
        } else {
            Self::Invalid
        }
    }
}

bitflags::bitflags! {
    /// File access mode. `WRITE` creates the file if it is absent.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mode: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const TRUNCATE = 1 << 2;
    }
}

/// Seek origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

/// Open file or directory descriptor. Never zero, so zero can serve as an
/// invalid sentinel where one is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fd(u16);

impl Fd {
    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// One `readdir` result. `.` and `..` are reported like any other entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: heapless::String<NAME_MAX>,
    pub size: usize,
    pub is_dir: bool,
}

struct FileHandle {
    fd: Fd,
    path: PathString,
    pos: u32,
    mode: Mode,
}

struct DirHandle {
    fd: Fd,
    path: PathString,
    /// Index of the next entry to report, counting `.` and `..`.
    index: usize,
}

enum Handle {
    Empty,
    File(FileHandle),
    Dir(DirHandle),
}

impl Handle {
    fn fd(&self) -> Option<Fd> {
        match self {
            Handle::Empty => None,
            Handle::File(f) => Some(f.fd),
            Handle::Dir(d) => Some(d.fd),
        }
    }
}

pub struct Fs<S> {
    storage: S,
    mount_count: usize,
    next_fd: u16,
    handles: [Handle; MAX_OPEN_FDS],
}

impl<S: Storage> Fs<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mount_count: 0,
            next_fd: FIRST_VALID_FD,
            handles: core::array::from_fn(|_| Handle::Empty),
        }
    }

    /// Hand the storage back, e.g. to rebuild the filesystem after a
    /// simulated reboot.
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Initialize after boot: drop any stale handles and take the boot mount
    /// reference. Formats the storage if it does not hold a mountable
    /// filesystem yet.
    pub fn init(&mut self) -> Result<()> {
        self.mount_count = 0;
        self.handles = core::array::from_fn(|_| Handle::Empty);
        self.mount()
    }

    /// Erase everything and recreate an empty filesystem. Open handles are
    /// invalidated.
    pub fn format(&mut self) -> Result<()> {
        self.mount_count = 0;
        self.handles = core::array::from_fn(|_| Handle::Empty);
        Filesystem::format(&mut self.storage)?;
        self.mount()
    }

    /// Take a mount reference. On the first reference the storage is checked
    /// and, if it does not mount, formatted once; this is the expected path
    /// on the very first boot.
    pub fn mount(&mut self) -> Result<()> {
        if self.mount_count == 0 && !Filesystem::is_mountable(&mut self.storage) {
            info!("storage not mountable, formatting");
            Filesystem::format(&mut self.storage)?;
            if !Filesystem::is_mountable(&mut self.storage) {
                return Err(Error::Io);
            }
        }
        self.mount_count += 1;
        Ok(())
    }

    /// Release one mount reference.
    pub fn unmount(&mut self) {
        self.mount_count = self.mount_count.saturating_sub(1);
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_count > 0
    }

    /// Run `f` against the mounted filesystem, holding a mount reference for
    /// the duration. Every exit path rebalances the count exactly once.
    fn with_fs<R>(&mut self, f: impl FnOnce(&Filesystem<'_, S>) -> Result<R>) -> Result<R> {
        self.mount()?;
        let mut out = None;
        let mounted = Filesystem::mount_and_then(&mut self.storage, |fs| {
            out = Some(f(fs));
            Ok(())
        });
        self.unmount();
        match mounted {
            Ok(()) => out.unwrap_or(Err(Error::Io)),
            Err(err) => Err(Error::from(err)),
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        path::check(path, MAX_DIR_DEPTH, false)?;
        let lfs_path = PathBuf::from(path);
        self.with_fs(|fs| match fs.create_dir(&lfs_path) {
            // An existing directory counts as success.
            Err(err) if err == LfsError::EntryAlreadyExisted => Ok(()),
            other => other.map_err(Error::from),
        })
    }

    /// Remove a directory; with `recursive` its contents are deleted first.
    pub fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        path::check(path, MAX_DIR_DEPTH, false)?;
        let lfs_path = PathBuf::from(path);
        self.with_fs(|fs| rmdir_at(fs, &lfs_path, recursive, 0))
    }

    pub fn exists(&mut self, path: &str) -> bool {
        if path::check(path, MAX_FILE_DEPTH, false).is_err() {
            return false;
        }
        let lfs_path = PathBuf::from(path);
        self.with_fs(|fs| Ok(fs.metadata(&lfs_path).is_ok()))
            .unwrap_or(false)
    }

    /// Delete a file or empty directory. Deleting something that is already
    /// gone counts as success.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        path::check(path, MAX_FILE_DEPTH, false)?;
        let lfs_path = PathBuf::from(path);
        self.with_fs(|fs| match fs.remove(&lfs_path) {
            Err(err) if err == LfsError::NoSuchEntry => Ok(()),
            other => other.map_err(Error::from),
        })
    }

    pub fn opendir(&mut self, path: &str) -> Result<Fd> {
        path::check(path, MAX_DIR_DEPTH, true)?;
        let slot = self.free_slot()?;
        let stored = path_string(path)?;
        let lfs_path = PathBuf::from(path);
        let meta = self.with_fs(|fs| fs.metadata(&lfs_path).map_err(Error::from))?;
        if !meta.is_dir() {
            return Err(Error::Invalid);
        }
        let fd = self.allocate_fd()?;
        self.handles[slot] = Handle::Dir(DirHandle {
            fd,
            path: stored,
            index: 0,
        });
        // Keep the filesystem mounted for the lifetime of the handle.
        self.mount()?;
        Ok(fd)
    }

    /// Next entry of an open directory, or `None` at the end.
    pub fn readdir(&mut self, fd: Fd) -> Result<Option<DirEntry>> {
        let (path, index) = {
            let dir = self.dir_handle(fd)?;
            (dir.path.clone(), dir.index)
        };
        let lfs_path = PathBuf::from(path.as_str());
        let entry = self.with_fs(|fs| {
            fs.read_dir_and_then(&lfs_path, |entries| match entries.nth(index) {
                Some(Ok(entry)) => Ok(Some(dir_entry(&entry)?)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            })
            .map_err(Error::from)
        })?;
        if entry.is_some() {
            self.dir_handle_mut(fd)?.index += 1;
        }
        Ok(entry)
    }

    pub fn closedir(&mut self, fd: Fd) -> Result<()> {
        let slot = self
            .handles
            .iter()
            .position(|h| matches!(h, Handle::Dir(d) if d.fd == fd))
            .ok_or(Error::Invalid)?;
        self.handles[slot] = Handle::Empty;
        self.unmount(); // releases the reference taken by opendir()
        Ok(())
    }

    pub fn open(&mut self, path: &str, mode: Mode) -> Result<Fd> {
        path::check(path, MAX_FILE_DEPTH, false)?;
        if !mode.intersects(Mode::READ | Mode::WRITE) {
            return Err(Error::Invalid);
        }
        let slot = self.free_slot()?;
        let stored = path_string(path)?;
        let lfs_path = PathBuf::from(path);
        let read = mode.contains(Mode::READ);
        let write = mode.contains(Mode::WRITE);
        let truncate = mode.contains(Mode::TRUNCATE);
        // Creation and truncation happen once, here; later reads and writes
        // reopen the file at the stored position.
        self.with_fs(|fs| {
            fs.open_file_with_options_and_then(
                |o| o.read(read).write(write).create(write).truncate(truncate),
                &lfs_path,
                |_| Ok(()),
            )
            .map_err(Error::from)
        })?;
        let fd = self.allocate_fd()?;
        self.handles[slot] = Handle::File(FileHandle {
            fd,
            path: stored,
            pos: 0,
            mode,
        });
        // Keep the filesystem mounted for the lifetime of the handle.
        self.mount()?;
        Ok(fd)
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let (path, pos, mode) = self.file_state(fd)?;
        if !mode.contains(Mode::READ) {
            return Err(Error::Invalid);
        }
        let lfs_path = PathBuf::from(path.as_str());
        let count = self.with_fs(|fs| {
            fs.open_file_and_then(&lfs_path, |file| {
                file.seek(SeekFrom::Start(pos))?;
                file.read(buf)
            })
            .map_err(Error::from)
        })?;
        self.file_handle_mut(fd)?.pos = pos + count as u32;
        Ok(count)
    }

    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        let (path, pos, mode) = self.file_state(fd)?;
        if !mode.contains(Mode::WRITE) {
            return Err(Error::Invalid);
        }
        let lfs_path = PathBuf::from(path.as_str());
        let count = self.with_fs(|fs| {
            fs.open_file_with_options_and_then(
                |o| o.write(true),
                &lfs_path,
                |file| {
                    file.seek(SeekFrom::Start(pos))?;
                    file.write(data)
                },
            )
            .map_err(Error::from)
        })?;
        self.file_handle_mut(fd)?.pos = pos + count as u32;
        Ok(count)
    }

    /// Move the file position. Seeking past the end is allowed; a later
    /// write extends the file.
    pub fn seek(&mut self, fd: Fd, offset: i32, whence: Whence) -> Result<u32> {
        let (path, pos, _) = self.file_state(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::from(pos),
            Whence::End => self.file_len(&path)? as i64,
        };
        let target = base + i64::from(offset);
        if target < 0 || target > i64::from(u32::MAX) {
            return Err(Error::Invalid);
        }
        self.file_handle_mut(fd)?.pos = target as u32;
        Ok(target as u32)
    }

    pub fn tell(&mut self, fd: Fd) -> Result<u32> {
        Ok(self.file_state(fd)?.1)
    }

    /// Whether the position is at (or past) the end of the file. Reports
    /// `true` on any failure.
    pub fn is_eof(&mut self, fd: Fd) -> bool {
        let Ok((path, pos, _)) = self.file_state(fd) else {
            return true;
        };
        match self.file_len(&path) {
            Ok(len) => pos as usize >= len,
            Err(_) => true,
        }
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let slot = self
            .handles
            .iter()
            .position(|h| matches!(h, Handle::File(f) if f.fd == fd))
            .ok_or(Error::Invalid)?;
        self.handles[slot] = Handle::Empty;
        self.unmount(); // releases the reference taken by open()
        Ok(())
    }

    fn file_len(&mut self, path: &PathString) -> Result<usize> {
        let lfs_path = PathBuf::from(path.as_str());
        self.with_fs(|fs| {
            fs.open_file_and_then(&lfs_path, |file| file.seek(SeekFrom::End(0)))
                .map_err(Error::from)
        })
    }

    fn free_slot(&self) -> Result<usize> {
        self.handles
            .iter()
            .position(|h| matches!(h, Handle::Empty))
            .ok_or(Error::Full)
    }

    fn fd_in_use(&self, fd: u16) -> bool {
        self.handles.iter().any(|h| h.fd().map(Fd::raw) == Some(fd))
    }

    /// Round-robin descriptor allocation with intentional wraparound back to
    /// the first valid value, skipping descriptors still in use.
    fn allocate_fd(&mut self) -> Result<Fd> {
        let first = self.next_fd;
        loop {
            self.next_fd = if self.next_fd == u16::MAX {
                FIRST_VALID_FD
            } else {
                self.next_fd + 1
            };
            if !self.fd_in_use(self.next_fd) {
                return Ok(Fd(self.next_fd));
            }
            if self.next_fd == first {
                return Err(Error::Full);
            }
        }
    }

    fn file_state(&self, fd: Fd) -> Result<(PathString, u32, Mode)> {
        self.handles
            .iter()
            .find_map(|h| match h {
                Handle::File(f) if f.fd == fd => Some((f.path.clone(), f.pos, f.mode)),
                _ => None,
            })
            .ok_or(Error::Invalid)
    }

    fn file_handle_mut(&mut self, fd: Fd) -> Result<&mut FileHandle> {
        self.handles
            .iter_mut()
            .find_map(|h| match h {
                Handle::File(f) if f.fd == fd => Some(f),
                _ => None,
            })
            .ok_or(Error::Invalid)
    }

    fn dir_handle(&self, fd: Fd) -> Result<&DirHandle> {
        self.handles
            .iter()
            .find_map(|h| match h {
                Handle::Dir(d) if d.fd == fd => Some(d),
                _ => None,
            })
            .ok_or(Error::Invalid)
    }

    fn dir_handle_mut(&mut self, fd: Fd) -> Result<&mut DirHandle> {
        self.handles
            .iter_mut()
            .find_map(|h| match h {
                Handle::Dir(d) if d.fd == fd => Some(d),
                _ => None,
            })
            .ok_or(Error::Invalid)
    }
}

fn path_string(path: &str) -> Result<PathString> {
    let mut out = PathString::new();
    out.push_str(path).map_err(|_| Error::Invalid)?;
    Ok(out)
}

fn entry_name(path: &Path) -> &str {
    let raw = path.as_str_ref_with_trailing_nul();
    raw.strip_suffix('\0').unwrap_or(raw)
}

fn dir_entry(entry: &littlefs2::fs::DirEntry) -> littlefs2::io::Result<DirEntry> {
    let mut name = heapless::String::new();
    name.push_str(entry_name(entry.file_name()))
        .map_err(|_| LfsError::FilenameTooLong)?;
    Ok(DirEntry {
        name,
        size: entry.metadata().len(),
        is_dir: entry.file_type().is_dir(),
    })
}

/// Depth-bounded recursive removal. Children are fetched one at a time so the
/// directory cursor never iterates across a concurrent deletion.
fn rmdir_at<S: Storage>(
    fs: &Filesystem<'_, S>,
    path: &Path,
    recursive: bool,
    depth: usize,
) -> Result<()> {
    if depth > MAX_FILE_DEPTH {
        return Err(Error::Invalid);
    }
    if recursive {
        loop {
            let child = fs
                .read_dir_and_then(path, |entries| {
                    // entries 0 and 1 are "." and ".."
                    match entries.nth(2) {
                        Some(Ok(entry)) => {
                            let child = child_path(path, entry.file_name())
                                .ok_or(LfsError::FilenameTooLong)?;
                            Ok(Some((child, entry.file_type().is_dir())))
                        }
                        Some(Err(err)) => Err(err),
                        None => Ok(None),
                    }
                })
                .map_err(Error::from)?;
            match child {
                Some((child, true)) => rmdir_at(fs, &child, true, depth + 1)?,
                Some((child, false)) => fs.remove(&child).map_err(Error::from)?,
                None => break,
            }
        }
    }
    fs.remove(path).map_err(Error::from)
}

fn child_path(parent: &Path, name: &Path) -> Option<PathBuf> {
    let parent = entry_name(parent);
    let name = entry_name(name);
    let mut buf = PathString::new();
    buf.push_str(parent).ok()?;
    if !parent.ends_with('/') {
        buf.push('/').ok()?;
    }
    buf.push_str(name).ok()?;
    Some(PathBuf::from(buf.as_str()))
}

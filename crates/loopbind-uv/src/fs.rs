//! Filesystem operations
//!
//! Each operation is a value ([`FsOp`]) that can run synchronously on the
//! calling thread ([`FsOp::run`]) or on the pool ([`Loop::fs`]).

use std::any::Any;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, FileType, Metadata};
use std::mem::ManuallyDrop;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

use crate::error::{check, check_size, Errno, UvResult};
use crate::event_loop::Loop;
use crate::request::{Done, ReqId, ReqType};

/// Fail with `EEXIST` if the destination exists.
pub const COPYFILE_EXCL: i32 = 1;
/// Try a copy-on-write clone, falling back to a plain copy.
pub const COPYFILE_FICLONE: i32 = 2;
/// Require a copy-on-write clone.
pub const COPYFILE_FICLONE_FORCE: i32 = 4;

/// Directory symlink (only meaningful on Windows).
pub const SYMLINK_DIR: i32 = 1;
/// Junction symlink (only meaningful on Windows).
pub const SYMLINK_JUNCTION: i32 = 2;

const SENDFILE_CHUNK: usize = 64 * 1024;

// ============================================================================
// Results
// ============================================================================

/// Seconds and nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

/// File status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub ino: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub flags: u64,
    pub gen: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub birthtime: Timespec,
}

impl Stat {
    pub fn from_metadata(md: &Metadata) -> Self {
        let ctime = Timespec {
            sec: md.ctime(),
            nsec: md.ctime_nsec(),
        };
        let birthtime = md
            .created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| Timespec {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos() as i64,
            })
            .unwrap_or(ctime);

        Stat {
            dev: md.dev(),
            mode: md.mode(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            ino: md.ino(),
            size: md.size(),
            blksize: md.blksize(),
            blocks: md.blocks(),
            flags: 0,
            gen: 0,
            atime: Timespec {
                sec: md.atime(),
                nsec: md.atime_nsec(),
            },
            mtime: Timespec {
                sec: md.mtime(),
                nsec: md.mtime_nsec(),
            },
            ctime,
            birthtime,
        }
    }

    /// File type name derived from `mode`.
    pub fn kind(&self) -> &'static str {
        let fmt = self.mode & (libc::S_IFMT as u32);
        if fmt == libc::S_IFREG as u32 {
            "file"
        } else if fmt == libc::S_IFDIR as u32 {
            "directory"
        } else if fmt == libc::S_IFLNK as u32 {
            "link"
        } else if fmt == libc::S_IFIFO as u32 {
            "fifo"
        } else if fmt == libc::S_IFSOCK as u32 {
            "socket"
        } else if fmt == libc::S_IFCHR as u32 {
            "char"
        } else if fmt == libc::S_IFBLK as u32 {
            "block"
        } else {
            "unknown"
        }
    }
}

/// Directory entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
    File,
    Directory,
    Link,
    Fifo,
    Socket,
    Char,
    Block,
    Unknown,
}

impl DirentType {
    pub fn name(self) -> &'static str {
        match self {
            DirentType::File => "file",
            DirentType::Directory => "directory",
            DirentType::Link => "link",
            DirentType::Fifo => "fifo",
            DirentType::Socket => "socket",
            DirentType::Char => "char",
            DirentType::Block => "block",
            DirentType::Unknown => "unknown",
        }
    }

    fn from_file_type(ft: FileType) -> Self {
        if ft.is_file() {
            DirentType::File
        } else if ft.is_dir() {
            DirentType::Directory
        } else if ft.is_symlink() {
            DirentType::Link
        } else if ft.is_fifo() {
            DirentType::Fifo
        } else if ft.is_socket() {
            DirentType::Socket
        } else if ft.is_char_device() {
            DirentType::Char
        } else if ft.is_block_device() {
            DirentType::Block
        } else {
            DirentType::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: Vec<u8>,
    pub kind: DirentType,
}

/// Result of a filesystem operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FsValue {
    /// Operations without a value.
    Done,
    /// Descriptor or byte count.
    Count(i64),
    Data(Vec<u8>),
    Stat(Stat),
    Path(PathBuf),
    TempFile { fd: i32, path: PathBuf },
    Entries(Vec<Dirent>),
}

// ============================================================================
// Operations
// ============================================================================

/// A filesystem operation. Offsets below zero mean "current position".
#[derive(Debug, Clone, PartialEq)]
pub enum FsOp {
    Open { path: PathBuf, flags: i32, mode: u32 },
    Close { fd: i32 },
    Read { fd: i32, len: usize, offset: i64 },
    Write { fd: i32, data: Vec<u8>, offset: i64 },
    Unlink { path: PathBuf },
    Mkdir { path: PathBuf, mode: u32 },
    Mkdtemp { template: PathBuf },
    Mkstemp { template: PathBuf },
    Rmdir { path: PathBuf },
    Scandir { path: PathBuf },
    Stat { path: PathBuf },
    Fstat { fd: i32 },
    Lstat { path: PathBuf },
    Rename { path: PathBuf, new_path: PathBuf },
    Fsync { fd: i32 },
    Fdatasync { fd: i32 },
    Ftruncate { fd: i32, offset: i64 },
    Sendfile { out_fd: i32, in_fd: i32, in_offset: i64, length: usize },
    Access { path: PathBuf, mode: i32 },
    Chmod { path: PathBuf, mode: u32 },
    Fchmod { fd: i32, mode: u32 },
    Utime { path: PathBuf, atime: f64, mtime: f64 },
    Futime { fd: i32, atime: f64, mtime: f64 },
    Lutime { path: PathBuf, atime: f64, mtime: f64 },
    Link { path: PathBuf, new_path: PathBuf },
    Symlink { path: PathBuf, new_path: PathBuf, flags: i32 },
    Readlink { path: PathBuf },
    Realpath { path: PathBuf },
    Chown { path: PathBuf, uid: u32, gid: u32 },
    Fchown { fd: i32, uid: u32, gid: u32 },
    Lchown { path: PathBuf, uid: u32, gid: u32 },
    Copyfile { path: PathBuf, new_path: PathBuf, flags: i32 },
}

fn cpath(path: &Path) -> UvResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn timespec(secs: f64) -> libc::timespec {
    let whole = secs.floor();
    libc::timespec {
        tv_sec: whole as libc::time_t,
        tv_nsec: ((secs - whole) * 1e9) as libc::c_long,
    }
}

// The descriptor stays owned by the caller.
fn borrow_fd(fd: i32) -> UvResult<ManuallyDrop<File>> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    // SAFETY: the File is never dropped, so the descriptor is not closed.
    Ok(ManuallyDrop::new(unsafe { File::from_raw_fd(fd) }))
}

fn unit(ret: libc::c_int) -> UvResult<FsValue> {
    check(ret).map(|_| FsValue::Done)
}

impl FsOp {
    /// Operation name (`"open"`, `"stat"`, ...), as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FsOp::Open { .. } => "open",
            FsOp::Close { .. } => "close",
            FsOp::Read { .. } => "read",
            FsOp::Write { .. } => "write",
            FsOp::Unlink { .. } => "unlink",
            FsOp::Mkdir { .. } => "mkdir",
            FsOp::Mkdtemp { .. } => "mkdtemp",
            FsOp::Mkstemp { .. } => "mkstemp",
            FsOp::Rmdir { .. } => "rmdir",
            FsOp::Scandir { .. } => "scandir",
            FsOp::Stat { .. } => "stat",
            FsOp::Fstat { .. } => "fstat",
            FsOp::Lstat { .. } => "lstat",
            FsOp::Rename { .. } => "rename",
            FsOp::Fsync { .. } => "fsync",
            FsOp::Fdatasync { .. } => "fdatasync",
            FsOp::Ftruncate { .. } => "ftruncate",
            FsOp::Sendfile { .. } => "sendfile",
            FsOp::Access { .. } => "access",
            FsOp::Chmod { .. } => "chmod",
            FsOp::Fchmod { .. } => "fchmod",
            FsOp::Utime { .. } => "utime",
            FsOp::Futime { .. } => "futime",
            FsOp::Lutime { .. } => "lutime",
            FsOp::Link { .. } => "link",
            FsOp::Symlink { .. } => "symlink",
            FsOp::Readlink { .. } => "readlink",
            FsOp::Realpath { .. } => "realpath",
            FsOp::Chown { .. } => "chown",
            FsOp::Fchown { .. } => "fchown",
            FsOp::Lchown { .. } => "lchown",
            FsOp::Copyfile { .. } => "copyfile",
        }
    }

    /// Primary path argument, if the operation takes one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            FsOp::Open { path, .. }
            | FsOp::Unlink { path }
            | FsOp::Mkdir { path, .. }
            | FsOp::Rmdir { path }
            | FsOp::Scandir { path }
            | FsOp::Stat { path }
            | FsOp::Lstat { path }
            | FsOp::Rename { path, .. }
            | FsOp::Access { path, .. }
            | FsOp::Chmod { path, .. }
            | FsOp::Utime { path, .. }
            | FsOp::Lutime { path, .. }
            | FsOp::Link { path, .. }
            | FsOp::Symlink { path, .. }
            | FsOp::Readlink { path }
            | FsOp::Realpath { path }
            | FsOp::Chown { path, .. }
            | FsOp::Lchown { path, .. }
            | FsOp::Copyfile { path, .. } => Some(path),
            FsOp::Mkdtemp { template } | FsOp::Mkstemp { template } => Some(template),
            _ => None,
        }
    }

    /// Destination path for two-path operations.
    pub fn dest(&self) -> Option<&Path> {
        match self {
            FsOp::Rename { new_path, .. }
            | FsOp::Link { new_path, .. }
            | FsOp::Symlink { new_path, .. }
            | FsOp::Copyfile { new_path, .. } => Some(new_path),
            _ => None,
        }
    }

    /// Execute on the calling thread.
    pub fn run(&self) -> UvResult<FsValue> {
        // SAFETY (all libc calls below): pointers come from live CStrings or
        // buffers sized for the call; descriptors are caller-provided.
        unsafe {
            match self {
                FsOp::Open { path, flags, mode } => {
                    let c = cpath(path)?;
                    let fd = check(libc::open(c.as_ptr(), flags | libc::O_CLOEXEC, *mode as libc::c_uint))?;
                    Ok(FsValue::Count(fd as i64))
                }
                FsOp::Close { fd } => unit(libc::close(*fd)),
                FsOp::Read { fd, len, offset } => {
                    let mut buf = Vec::new();
                    buf.try_reserve_exact(*len).map_err(|_| Errno::ENOMEM)?;
                    let ptr = buf.spare_capacity_mut().as_mut_ptr() as *mut libc::c_void;
                    let n = if *offset < 0 {
                        check_size(libc::read(*fd, ptr, *len))?
                    } else {
                        check_size(libc::pread(*fd, ptr, *len, *offset as libc::off_t))?
                    };
                    // the kernel initialized the first n bytes
                    buf.set_len(n);
                    Ok(FsValue::Data(buf))
                }
                FsOp::Write { fd, data, offset } => {
                    let ptr = data.as_ptr() as *const libc::c_void;
                    let n = if *offset < 0 {
                        check_size(libc::write(*fd, ptr, data.len()))?
                    } else {
                        check_size(libc::pwrite(*fd, ptr, data.len(), *offset as libc::off_t))?
                    };
                    Ok(FsValue::Count(n as i64))
                }
                FsOp::Unlink { path } => unit(libc::unlink(cpath(path)?.as_ptr())),
                FsOp::Mkdir { path, mode } => unit(libc::mkdir(cpath(path)?.as_ptr(), *mode as libc::mode_t)),
                FsOp::Mkdtemp { template } => {
                    let mut buf = cpath(template)?.into_bytes_with_nul();
                    if libc::mkdtemp(buf.as_mut_ptr() as *mut libc::c_char).is_null() {
                        return Err(Errno::last_os_error());
                    }
                    buf.pop();
                    Ok(FsValue::Path(PathBuf::from(OsStr::from_bytes(&buf))))
                }
                FsOp::Mkstemp { template } => {
                    let mut buf = cpath(template)?.into_bytes_with_nul();
                    let fd = check(libc::mkstemp(buf.as_mut_ptr() as *mut libc::c_char))?;
                    buf.pop();
                    Ok(FsValue::TempFile {
                        fd,
                        path: PathBuf::from(OsStr::from_bytes(&buf)),
                    })
                }
                FsOp::Rmdir { path } => unit(libc::rmdir(cpath(path)?.as_ptr())),
                FsOp::Scandir { path } => scandir(path),
                FsOp::Stat { path } => Ok(FsValue::Stat(Stat::from_metadata(&fs::metadata(path)?))),
                FsOp::Lstat { path } => Ok(FsValue::Stat(Stat::from_metadata(&fs::symlink_metadata(path)?))),
                FsOp::Fstat { fd } => {
                    let file = borrow_fd(*fd)?;
                    Ok(FsValue::Stat(Stat::from_metadata(&file.metadata()?)))
                }
                FsOp::Rename { path, new_path } => {
                    unit(libc::rename(cpath(path)?.as_ptr(), cpath(new_path)?.as_ptr()))
                }
                FsOp::Fsync { fd } => unit(libc::fsync(*fd)),
                #[cfg(target_os = "linux")]
                FsOp::Fdatasync { fd } => unit(libc::fdatasync(*fd)),
                #[cfg(not(target_os = "linux"))]
                FsOp::Fdatasync { fd } => unit(libc::fsync(*fd)),
                FsOp::Ftruncate { fd, offset } => unit(libc::ftruncate(*fd, *offset as libc::off_t)),
                FsOp::Sendfile {
                    out_fd,
                    in_fd,
                    in_offset,
                    length,
                } => sendfile(*out_fd, *in_fd, *in_offset, *length),
                FsOp::Access { path, mode } => unit(libc::access(cpath(path)?.as_ptr(), *mode)),
                FsOp::Chmod { path, mode } => unit(libc::chmod(cpath(path)?.as_ptr(), *mode as libc::mode_t)),
                FsOp::Fchmod { fd, mode } => unit(libc::fchmod(*fd, *mode as libc::mode_t)),
                FsOp::Utime { path, atime, mtime } => {
                    let times = [timespec(*atime), timespec(*mtime)];
                    unit(libc::utimensat(libc::AT_FDCWD, cpath(path)?.as_ptr(), times.as_ptr(), 0))
                }
                FsOp::Lutime { path, atime, mtime } => {
                    let times = [timespec(*atime), timespec(*mtime)];
                    unit(libc::utimensat(
                        libc::AT_FDCWD,
                        cpath(path)?.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    ))
                }
                FsOp::Futime { fd, atime, mtime } => {
                    let times = [timespec(*atime), timespec(*mtime)];
                    unit(libc::futimens(*fd, times.as_ptr()))
                }
                FsOp::Link { path, new_path } => {
                    unit(libc::link(cpath(path)?.as_ptr(), cpath(new_path)?.as_ptr()))
                }
                FsOp::Symlink { path, new_path, .. } => {
                    unit(libc::symlink(cpath(path)?.as_ptr(), cpath(new_path)?.as_ptr()))
                }
                FsOp::Readlink { path } => Ok(FsValue::Path(fs::read_link(path)?)),
                FsOp::Realpath { path } => Ok(FsValue::Path(fs::canonicalize(path)?)),
                FsOp::Chown { path, uid, gid } => unit(libc::chown(cpath(path)?.as_ptr(), *uid, *gid)),
                FsOp::Fchown { fd, uid, gid } => unit(libc::fchown(*fd, *uid, *gid)),
                FsOp::Lchown { path, uid, gid } => unit(libc::lchown(cpath(path)?.as_ptr(), *uid, *gid)),
                FsOp::Copyfile { path, new_path, flags } => copyfile(path, new_path, *flags),
            }
        }
    }
}

fn scandir(path: &Path) -> UvResult<FsValue> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let kind = entry
            .file_type()
            .map(DirentType::from_file_type)
            .unwrap_or(DirentType::Unknown);
        entries.push(Dirent {
            name: entry.file_name().as_bytes().to_vec(),
            kind,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(FsValue::Entries(entries))
}

// Read/write loop so it works for any pair of descriptors.
fn sendfile(out_fd: i32, in_fd: i32, in_offset: i64, length: usize) -> UvResult<FsValue> {
    let mut buf = vec![0u8; SENDFILE_CHUNK.min(length.max(1))];
    let mut total = 0usize;
    while total < length {
        let want = buf.len().min(length - total);
        let ptr = buf.as_mut_ptr() as *mut libc::c_void;
        // SAFETY: `want` never exceeds the buffer length.
        let n = unsafe {
            if in_offset < 0 {
                check_size(libc::read(in_fd, ptr, want))?
            } else {
                check_size(libc::pread(in_fd, ptr, want, (in_offset + total as i64) as libc::off_t))?
            }
        };
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            // SAFETY: writing from the initialized prefix of the buffer.
            let w = unsafe {
                check_size(libc::write(
                    out_fd,
                    buf[written..n].as_ptr() as *const libc::c_void,
                    n - written,
                ))?
            };
            written += w;
        }
        total += n;
    }
    Ok(FsValue::Count(total as i64))
}

fn copyfile(from: &Path, to: &Path, flags: i32) -> UvResult<FsValue> {
    if flags & COPYFILE_FICLONE_FORCE != 0 {
        return Err(Errno::ENOTSUP);
    }
    if flags & COPYFILE_EXCL != 0 && fs::symlink_metadata(to).is_ok() {
        return Err(Errno::EEXIST);
    }
    fs::copy(from, to)?;
    Ok(FsValue::Done)
}

/// Completion callback for pool-run operations.
pub type FsCb = fn(&Loop, Done<FsValue>);

impl Loop {
    /// Run `op` on the pool.
    pub fn fs(&self, op: FsOp, data: Option<Rc<dyn Any>>, cb: FsCb) -> UvResult<ReqId> {
        tracing::trace!(op = op.name(), "queueing fs request");
        self.submit(ReqType::Fs, data, move || op.run(), cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::RunMode;
    use std::cell::RefCell;

    fn p(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_open_write_read_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "data.txt");
        let fd = match (FsOp::Open {
            path: path.clone(),
            flags: libc::O_CREAT | libc::O_RDWR,
            mode: 0o644,
        })
        .run()
        .unwrap()
        {
            FsValue::Count(fd) => fd as i32,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            FsOp::Write { fd, data: b"hello world".to_vec(), offset: 0 }.run(),
            Ok(FsValue::Count(11))
        );
        assert_eq!(
            FsOp::Read { fd, len: 5, offset: 6 }.run(),
            Ok(FsValue::Data(b"world".to_vec()))
        );
        assert_eq!(FsOp::Close { fd }.run(), Ok(FsValue::Done));
        assert_eq!(FsOp::Close { fd }.run(), Err(Errno::EBADF));
    }

    #[test]
    fn test_oversized_read_is_enomem() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "small"), b"abc").unwrap();
        let file = fs::File::open(p(&dir, "small")).unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        assert_eq!(FsOp::Read { fd, len: 1 << 62, offset: 0 }.run(), Err(Errno::ENOMEM));
        assert_eq!(
            FsOp::Read { fd, len: 16, offset: 0 }.run(),
            Ok(FsValue::Data(b"abc".to_vec()))
        );
    }

    #[test]
    fn test_stat_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let op = FsOp::Stat { path: p(&dir, "nope") };
        assert_eq!(op.run(), Err(Errno::ENOENT));
        assert_eq!(op.name(), "stat");
        assert_eq!(op.path(), Some(p(&dir, "nope").as_path()));
    }

    #[test]
    fn test_stat_kinds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "f"), b"abc").unwrap();
        match (FsOp::Stat { path: p(&dir, "f") }).run().unwrap() {
            FsValue::Stat(st) => {
                assert_eq!(st.kind(), "file");
                assert_eq!(st.size, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        match (FsOp::Stat { path: dir.path().to_path_buf() }).run().unwrap() {
            FsValue::Stat(st) => assert_eq!(st.kind(), "directory"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scandir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "b"), b"").unwrap();
        fs::write(p(&dir, "a"), b"").unwrap();
        fs::create_dir(p(&dir, "c")).unwrap();
        match (FsOp::Scandir { path: dir.path().to_path_buf() }).run().unwrap() {
            FsValue::Entries(entries) => {
                let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
                assert_eq!(names, vec![&b"a"[..], b"b", b"c"]);
                assert_eq!(entries[2].kind, DirentType::Directory);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mkdtemp_and_mkstemp() {
        let dir = tempfile::tempdir().unwrap();
        match (FsOp::Mkdtemp { template: p(&dir, "tmpXXXXXX") }).run().unwrap() {
            FsValue::Path(path) => assert!(path.is_dir()),
            other => panic!("unexpected {:?}", other),
        }
        match (FsOp::Mkstemp { template: p(&dir, "fileXXXXXX") }).run().unwrap() {
            FsValue::TempFile { fd, path } => {
                assert!(fd >= 0);
                assert!(path.is_file());
                FsOp::Close { fd }.run().unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_copyfile_excl() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "src"), b"x").unwrap();
        fs::write(p(&dir, "dst"), b"y").unwrap();
        let op = FsOp::Copyfile {
            path: p(&dir, "src"),
            new_path: p(&dir, "dst"),
            flags: COPYFILE_EXCL,
        };
        assert_eq!(op.run(), Err(Errno::EEXIST));
        assert_eq!(op.dest(), Some(p(&dir, "dst").as_path()));
        let op = FsOp::Copyfile {
            path: p(&dir, "src"),
            new_path: p(&dir, "dst"),
            flags: 0,
        };
        assert_eq!(op.run(), Ok(FsValue::Done));
        assert_eq!(fs::read(p(&dir, "dst")).unwrap(), b"x");
    }

    #[test]
    fn test_symlink_readlink() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "target"), b"").unwrap();
        FsOp::Symlink {
            path: p(&dir, "target"),
            new_path: p(&dir, "link"),
            flags: 0,
        }
        .run()
        .unwrap();
        assert_eq!(
            (FsOp::Readlink { path: p(&dir, "link") }).run(),
            Ok(FsValue::Path(p(&dir, "target")))
        );
        match (FsOp::Lstat { path: p(&dir, "link") }).run().unwrap() {
            FsValue::Stat(st) => assert_eq!(st.kind(), "link"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sendfile_copies_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(p(&dir, "in"), b"0123456789").unwrap();
        let open = |name: &str, flags: i32| match (FsOp::Open {
            path: p(&dir, name),
            flags,
            mode: 0o644,
        })
        .run()
        .unwrap()
        {
            FsValue::Count(fd) => fd as i32,
            other => panic!("unexpected {:?}", other),
        };
        let in_fd = open("in", libc::O_RDONLY);
        let out_fd = open("out", libc::O_CREAT | libc::O_WRONLY);
        assert_eq!(
            (FsOp::Sendfile { out_fd, in_fd, in_offset: 2, length: 5 }).run(),
            Ok(FsValue::Count(5))
        );
        FsOp::Close { fd: in_fd }.run().unwrap();
        FsOp::Close { fd: out_fd }.run().unwrap();
        assert_eq!(fs::read(p(&dir, "out")).unwrap(), b"23456");
    }

    thread_local! {
        static OUT: RefCell<Vec<UvResult<FsValue>>> = RefCell::new(Vec::new());
    }

    fn record(_lp: &Loop, done: Done<FsValue>) {
        OUT.with(|o| o.borrow_mut().push(done.result));
    }

    #[test]
    fn test_async_fs_request() {
        OUT.with(|o| o.borrow_mut().clear());
        let dir = tempfile::tempdir().unwrap();
        let lp = Loop::with_pool_size(2);
        lp.fs(FsOp::Mkdir { path: p(&dir, "sub"), mode: 0o755 }, None, record)
            .unwrap();
        lp.fs(FsOp::Access { path: p(&dir, "missing"), mode: libc::F_OK }, None, record)
            .unwrap();
        lp.run(RunMode::Default);
        OUT.with(|o| {
            let out = o.borrow();
            assert_eq!(out.len(), 2);
            assert!(out.contains(&Ok(FsValue::Done)));
            assert!(out.contains(&Err(Errno::ENOENT)));
        });
        assert!(p(&dir, "sub").is_dir());
    }
}

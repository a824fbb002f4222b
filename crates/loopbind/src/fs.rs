//! Filesystem operations
//!
//! Every operation runs synchronously when no callback is given and returns
//! its values (or the failure triple, with the path in the message). With a
//! callback it is queued on the pool and the request object is returned;
//! the callback later receives `nil, values...` or the error message.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use loopbind_sdk::{userdata_of, AbiResult, ScriptContext, Userdata, Value};
use loopbind_uv::fs::{COPYFILE_EXCL, COPYFILE_FICLONE, COPYFILE_FICLONE_FORCE, SYMLINK_DIR, SYMLINK_JUNCTION};
use loopbind_uv::{Dirent, Done, FsOp, FsValue, Loop, ReqType, Stat, Timespec};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::request::{self, RequestWrapper};
use crate::result;

// ============================================================================
// Argument helpers
// ============================================================================

fn check_path(args: &Args<'_>, index: usize) -> AbiResult<PathBuf> {
    let bytes = args.bytes(index)?;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

fn check_fd(args: &Args<'_>, index: usize) -> AbiResult<i32> {
    args.integer_as(index, "fd")
}

fn check_mode(args: &Args<'_>, index: usize) -> AbiResult<u32> {
    args.integer_as(index, "mode")
}

/// Owner ids; -1 leaves the id unchanged, as chown(2) does.
fn check_id(args: &Args<'_>, index: usize, what: &str) -> AbiResult<u32> {
    if args.integer(index)? == -1 {
        return Ok(u32::MAX);
    }
    args.integer_as(index, what)
}

/// Open flags as an integer or an fopen-style string.
pub(crate) fn check_flags(args: &Args<'_>, index: usize) -> AbiResult<i32> {
    let Value::String(_) = args.get(index) else {
        return args.integer_as(index, "flags");
    };
    let s = args.string(index)?;
    open_flags(&s).ok_or_else(|| args.error(index, format!("unknown file open flag '{}'", s)))
}

pub(crate) fn open_flags(s: &str) -> Option<i32> {
    use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_SYNC, O_TRUNC, O_WRONLY};
    let flags = match s {
        "r" => O_RDONLY,
        "rs" | "sr" => O_RDONLY | O_SYNC,
        "r+" => O_RDWR,
        "rs+" | "sr+" => O_RDWR | O_SYNC,
        "w" => O_TRUNC | O_CREAT | O_WRONLY,
        "wx" | "xw" => O_TRUNC | O_CREAT | O_WRONLY | O_EXCL,
        "w+" => O_TRUNC | O_CREAT | O_RDWR,
        "wx+" | "xw+" => O_TRUNC | O_CREAT | O_RDWR | O_EXCL,
        "a" => O_APPEND | O_CREAT | O_WRONLY,
        "ax" | "xa" => O_APPEND | O_CREAT | O_WRONLY | O_EXCL,
        "a+" => O_APPEND | O_CREAT | O_RDWR,
        "ax+" | "xa+" => O_APPEND | O_CREAT | O_RDWR | O_EXCL,
        _ => return None,
    };
    Some(flags)
}

/// Access mode as an integer or a subset of `"rwx"`.
fn check_amode(args: &Args<'_>, index: usize) -> AbiResult<i32> {
    let Value::String(_) = args.get(index) else {
        return args.integer_as(index, "mode");
    };
    let s = args.string(index)?;
    let mut mode = libc::F_OK;
    for c in s.chars() {
        mode |= match c.to_ascii_lowercase() {
            'r' => libc::R_OK,
            'w' => libc::W_OK,
            'x' => libc::X_OK,
            _ => return Err(args.error(index, "unknown character in access mode string")),
        };
    }
    Ok(mode)
}

/// Integer flags, or a table of named booleans.
fn check_flag_table(args: &Args<'_>, index: usize, names: &[(&str, i32)]) -> AbiResult<i32> {
    match args.get(index) {
        Value::Nil => Ok(0),
        Value::Table(_) => {
            let table = args.get(index);
            Ok(names
                .iter()
                .filter(|(name, _)| table.get(name).is_some_and(Value::truthy))
                .fold(0, |acc, &(_, bit)| acc | bit))
        }
        _ => args.integer_as(index, "flags"),
    }
}

/// Write payload: a string or a list of strings.
fn check_data(args: &Args<'_>, index: usize) -> AbiResult<Vec<u8>> {
    match args.get(index) {
        Value::List(parts) => {
            let mut data = Vec::new();
            for part in parts {
                let bytes = part
                    .as_bytes()
                    .ok_or_else(|| args.error(index, "table of strings expected"))?;
                data.extend_from_slice(bytes);
            }
            Ok(data)
        }
        _ => args.bytes(index),
    }
}

/// Optional argument followed by the callback: a callable in the optional
/// slot means the argument was left out.
fn optional_before_callback(args: &Args<'_>, index: usize) -> (bool, usize) {
    if args.ctx().is_callable(args.get(index)) {
        (false, index)
    } else {
        (!args.is_none_or_nil(index), index + 1)
    }
}

// ============================================================================
// Results
// ============================================================================

fn path_value(path: &Path) -> Value {
    Value::String(path.as_os_str().as_bytes().to_vec())
}

fn timespec_table(ts: &Timespec) -> Value {
    Value::Table(vec![
        ("sec".to_string(), Value::Integer(ts.sec)),
        ("nsec".to_string(), Value::Integer(ts.nsec)),
    ])
}

/// Stat result as a table, with `type` derived from the mode.
pub(crate) fn stat_table(stat: &Stat) -> Value {
    let int = |n: u64| Value::Integer(n as i64);
    Value::Table(vec![
        ("dev".to_string(), int(stat.dev)),
        ("mode".to_string(), int(stat.mode as u64)),
        ("nlink".to_string(), int(stat.nlink)),
        ("uid".to_string(), int(stat.uid as u64)),
        ("gid".to_string(), int(stat.gid as u64)),
        ("rdev".to_string(), int(stat.rdev)),
        ("ino".to_string(), int(stat.ino)),
        ("size".to_string(), int(stat.size)),
        ("blksize".to_string(), int(stat.blksize)),
        ("blocks".to_string(), int(stat.blocks)),
        ("flags".to_string(), int(stat.flags)),
        ("gen".to_string(), int(stat.gen)),
        ("atime".to_string(), timespec_table(&stat.atime)),
        ("mtime".to_string(), timespec_table(&stat.mtime)),
        ("ctime".to_string(), timespec_table(&stat.ctime)),
        ("birthtime".to_string(), timespec_table(&stat.birthtime)),
        ("type".to_string(), Value::from(stat.kind())),
    ])
}

/// Directory listing handed out by `fs_scandir`, drained by
/// `fs_scandir_next`.
pub(crate) struct ScandirUserdata {
    entries: RefCell<VecDeque<Dirent>>,
}

impl Userdata for ScandirUserdata {
    fn type_name(&self) -> &'static str {
        "uv_fs_scandir"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

fn fs_values(ctx: &dyn ScriptContext, value: FsValue) -> AbiResult<Vec<Value>> {
    Ok(match value {
        FsValue::Done => vec![Value::Boolean(true)],
        FsValue::Count(n) => vec![Value::Integer(n)],
        FsValue::Data(data) => vec![Value::String(data)],
        FsValue::Stat(stat) => vec![stat_table(&stat)],
        FsValue::Path(path) => vec![Value::String(path.into_os_string().into_vec())],
        FsValue::TempFile { fd, path } => vec![Value::Integer(fd as i64), path_value(&path)],
        FsValue::Entries(entries) => {
            let listing = Rc::new(ScandirUserdata {
                entries: RefCell::new(entries.into()),
            });
            vec![ctx.new_userdata(listing)?]
        }
    })
}

/// Paths named in error messages of a queued operation.
struct FsContext {
    path: Option<PathBuf>,
    dest: Option<PathBuf>,
}

fn fs_cb(lp: &Loop, done: Done<FsValue>) {
    request::complete(lp, done, |ctx, wrapper: &RequestWrapper, result| match result {
        Ok(value) => match fs_values(ctx, value) {
            Ok(values) => std::iter::once(Value::Nil).chain(values).collect(),
            Err(err) => vec![Value::from(err.to_string())],
        },
        Err(err) => {
            let context = wrapper.extra::<FsContext>();
            let path = context.as_ref().and_then(|c| c.path.as_deref());
            let dest = context.as_ref().and_then(|c| c.dest.as_deref());
            vec![Value::from(result::fs_message(err, path, dest))]
        }
    });
}

/// Run `op` now, or queue it when the argument at `cb_index` is a callback.
fn perform(bridge: &Bridge, args: &Args<'_>, op: FsOp, cb_index: usize) -> AbiResult<Vec<Value>> {
    let Some(callback) = args.opt_callable(cb_index)? else {
        tracing::trace!(op = op.name(), "fs sync");
        return match op.run() {
            Ok(value) => fs_values(args.ctx(), value),
            Err(err) => Ok(result::fail_with(err, result::fs_message(err, op.path(), op.dest()))),
        };
    };

    let (wrapper, value) = request::new_request(bridge, ReqType::Fs, Some(callback), &[])?;
    wrapper.set_extra(Rc::new(FsContext {
        path: op.path().map(Path::to_path_buf),
        dest: op.dest().map(Path::to_path_buf),
    }));
    match bridge.native().fs(op, request::data_of(&wrapper), fs_cb) {
        Ok(req) => {
            wrapper.submitted(req);
            Ok(vec![value])
        }
        Err(err) => {
            wrapper.discard(args.ctx());
            Ok(result::fail(err))
        }
    }
}

// ============================================================================
// Bound functions
// ============================================================================

/// `fs_open(path, flags, mode, [callback])`
pub fn open(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Open {
        path: check_path(&args, 1)?,
        flags: check_flags(&args, 2)?,
        mode: check_mode(&args, 3)?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_close(fd, [callback])`
pub fn close(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Close { fd: check_fd(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_read(fd, size, [offset], [callback])`
pub fn read(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let fd = check_fd(&args, 1)?;
    let len = args.integer(2)?;
    if len < 0 {
        return Err(args.error(2, "length must be non-negative"));
    }
    let (has_offset, cb_index) = optional_before_callback(&args, 3);
    let offset = if has_offset { args.integer(3)? } else { -1 };
    let op = FsOp::Read {
        fd,
        len: len as usize,
        offset,
    };
    perform(bridge, &args, op, cb_index)
}

/// `fs_write(fd, data, [offset], [callback])`
pub fn write(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let fd = check_fd(&args, 1)?;
    let data = check_data(&args, 2)?;
    let (has_offset, cb_index) = optional_before_callback(&args, 3);
    let offset = if has_offset { args.integer(3)? } else { -1 };
    perform(bridge, &args, FsOp::Write { fd, data, offset }, cb_index)
}

/// `fs_unlink(path, [callback])`
pub fn unlink(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Unlink { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_mkdir(path, mode, [callback])`
pub fn mkdir(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Mkdir {
        path: check_path(&args, 1)?,
        mode: check_mode(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_mkdtemp(template, [callback])`
pub fn mkdtemp(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Mkdtemp { template: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_mkstemp(template, [callback])` returns the descriptor and the path.
pub fn mkstemp(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Mkstemp { template: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_rmdir(path, [callback])`
pub fn rmdir(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Rmdir { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_scandir(path, [callback])`
pub fn scandir(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Scandir { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_scandir_next(listing)` returns the next name and type, or nothing
/// once the listing is exhausted.
pub fn scandir_next(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let listing = userdata_of::<ScandirUserdata>(args.ctx(), args.get(1))
        .ok_or_else(|| args.expected(1, "uv_fs_scandir"))?;
    let next = listing.entries.borrow_mut().pop_front();
    Ok(match next {
        Some(entry) => vec![Value::String(entry.name), Value::from(entry.kind.name())],
        None => Vec::new(),
    })
}

/// `fs_stat(path, [callback])`
pub fn stat(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Stat { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_fstat(fd, [callback])`
pub fn fstat(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Fstat { fd: check_fd(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_lstat(path, [callback])`
pub fn lstat(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Lstat { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_rename(path, new_path, [callback])`
pub fn rename(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Rename {
        path: check_path(&args, 1)?,
        new_path: check_path(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_fsync(fd, [callback])`
pub fn fsync(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Fsync { fd: check_fd(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_fdatasync(fd, [callback])`
pub fn fdatasync(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Fdatasync { fd: check_fd(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_ftruncate(fd, offset, [callback])`
pub fn ftruncate(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Ftruncate {
        fd: check_fd(&args, 1)?,
        offset: args.integer(2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_sendfile(out_fd, in_fd, in_offset, size, [callback])`
pub fn sendfile(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let length = args.integer(4)?;
    if length < 0 {
        return Err(args.error(4, "length must be non-negative"));
    }
    let op = FsOp::Sendfile {
        out_fd: check_fd(&args, 1)?,
        in_fd: check_fd(&args, 2)?,
        in_offset: args.integer(3)?,
        length: length as usize,
    };
    perform(bridge, &args, op, 5)
}

/// `fs_access(path, mode, [callback])`
pub fn access(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Access {
        path: check_path(&args, 1)?,
        mode: check_amode(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_chmod(path, mode, [callback])`
pub fn chmod(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Chmod {
        path: check_path(&args, 1)?,
        mode: check_mode(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_fchmod(fd, mode, [callback])`
pub fn fchmod(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Fchmod {
        fd: check_fd(&args, 1)?,
        mode: check_mode(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_utime(path, atime, mtime, [callback])`
pub fn utime(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Utime {
        path: check_path(&args, 1)?,
        atime: args.number(2)?,
        mtime: args.number(3)?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_futime(fd, atime, mtime, [callback])`
pub fn futime(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Futime {
        fd: check_fd(&args, 1)?,
        atime: args.number(2)?,
        mtime: args.number(3)?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_lutime(path, atime, mtime, [callback])`
pub fn lutime(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Lutime {
        path: check_path(&args, 1)?,
        atime: args.number(2)?,
        mtime: args.number(3)?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_link(path, new_path, [callback])`
pub fn link(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Link {
        path: check_path(&args, 1)?,
        new_path: check_path(&args, 2)?,
    };
    perform(bridge, &args, op, 3)
}

/// `fs_symlink(path, new_path, [flags], [callback])`; flags may be a table
/// with `dir` and `junction`.
pub fn symlink(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let path = check_path(&args, 1)?;
    let new_path = check_path(&args, 2)?;
    let (has_flags, cb_index) = optional_before_callback(&args, 3);
    let flags = if has_flags {
        check_flag_table(&args, 3, &[("dir", SYMLINK_DIR), ("junction", SYMLINK_JUNCTION)])?
    } else {
        0
    };
    perform(bridge, &args, FsOp::Symlink { path, new_path, flags }, cb_index)
}

/// `fs_readlink(path, [callback])`
pub fn readlink(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Readlink { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_realpath(path, [callback])`
pub fn realpath(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Realpath { path: check_path(&args, 1)? };
    perform(bridge, &args, op, 2)
}

/// `fs_chown(path, uid, gid, [callback])`
pub fn chown(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Chown {
        path: check_path(&args, 1)?,
        uid: check_id(&args, 2, "uid")?,
        gid: check_id(&args, 3, "gid")?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_fchown(fd, uid, gid, [callback])`
pub fn fchown(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Fchown {
        fd: check_fd(&args, 1)?,
        uid: check_id(&args, 2, "uid")?,
        gid: check_id(&args, 3, "gid")?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_lchown(path, uid, gid, [callback])`
pub fn lchown(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let op = FsOp::Lchown {
        path: check_path(&args, 1)?,
        uid: check_id(&args, 2, "uid")?,
        gid: check_id(&args, 3, "gid")?,
    };
    perform(bridge, &args, op, 4)
}

/// `fs_copyfile(path, new_path, [flags], [callback])`; flags may be a table
/// with `excl`, `ficlone` and `ficlone_force`.
pub fn copyfile(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let path = check_path(&args, 1)?;
    let new_path = check_path(&args, 2)?;
    let (has_flags, cb_index) = optional_before_callback(&args, 3);
    let flags = if has_flags {
        check_flag_table(
            &args,
            3,
            &[
                ("excl", COPYFILE_EXCL),
                ("ficlone", COPYFILE_FICLONE),
                ("ficlone_force", COPYFILE_FICLONE_FORCE),
            ],
        )?
    } else {
        0
    };
    perform(bridge, &args, FsOp::Copyfile { path, new_path, flags }, cb_index)
}

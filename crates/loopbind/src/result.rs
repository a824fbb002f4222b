//! Uniform result convention
//!
//! Native failures never raise. A bound function that fails returns
//! `nil, "NAME: message", "NAME"`; one that succeeds returns its values, with
//! `true` standing in for a bare zero status. Callbacks get the error as
//! their first argument, or `nil` on success.

use std::path::Path;

use loopbind_sdk::Value;
use loopbind_uv::{Errno, UvResult};

/// `"NAME: message"` for a status code.
pub fn error_message(err: Errno) -> String {
    format!("{}: {}", err.name(), err.message())
}

/// The failure triple.
pub fn fail(err: Errno) -> Vec<Value> {
    vec![Value::Nil, Value::from(error_message(err)), Value::from(err.name().into_owned())]
}

/// Failure triple with a custom message (filesystem errors carry paths).
pub(crate) fn fail_with(err: Errno, message: String) -> Vec<Value> {
    vec![Value::Nil, Value::from(message), Value::from(err.name().into_owned())]
}

/// `true` on success.
pub(crate) fn status(result: UvResult<()>) -> Vec<Value> {
    match result {
        Ok(()) => vec![Value::Boolean(true)],
        Err(err) => fail(err),
    }
}

/// The count on success.
pub(crate) fn count(result: UvResult<u64>) -> Vec<Value> {
    match result {
        Ok(n) => vec![Value::Integer(n as i64)],
        Err(err) => fail(err),
    }
}

/// First argument of a handle event callback: `nil` or the error name.
pub(crate) fn event_status(result: UvResult<()>) -> Value {
    match result {
        Ok(()) => Value::Nil,
        Err(err) => Value::from(err.name().into_owned()),
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Filesystem error text: `"NAME: message: path"`, or
/// `"NAME: message: path -> dest"` for two-path operations.
pub(crate) fn fs_message(err: Errno, path: Option<&Path>, dest: Option<&Path>) -> String {
    match (path, dest) {
        (Some(path), Some(dest)) => format!("{}: {} -> {}", error_message(err), display(path), display(dest)),
        (Some(path), None) => format!("{}: {}", error_message(err), display(path)),
        _ => error_message(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopbind_uv::FsOp;
    use std::path::PathBuf;

    #[test]
    fn test_fail_triple() {
        assert_eq!(
            fail(Errno::ENOENT),
            vec![
                Value::Nil,
                Value::from("ENOENT: no such file or directory"),
                Value::from("ENOENT")
            ]
        );
    }

    #[test]
    fn test_every_code_round_trips_through_the_triple() {
        for err in Errno::all() {
            let triple = fail(err);
            assert_eq!(triple.len(), 3);
            assert!(triple[0].is_nil());
            let name = triple[2].as_str().unwrap();
            assert_eq!(Errno::from_name(name), Some(err));
            let message = triple[1].as_str().unwrap();
            assert_eq!(message, format!("{}: {}", name, err.message()));
        }
    }

    #[test]
    fn test_status_and_count() {
        assert_eq!(status(Ok(())), vec![Value::Boolean(true)]);
        assert_eq!(count(Ok(12)), vec![Value::Integer(12)]);
        assert_eq!(count(Err(Errno::EBADF))[2], Value::from("EBADF"));
        assert_eq!(event_status(Ok(())), Value::Nil);
        assert_eq!(event_status(Err(Errno::ECANCELED)), Value::from("ECANCELED"));
    }

    #[test]
    fn test_fs_messages_carry_paths() {
        let op = FsOp::Rename {
            path: PathBuf::from("/a"),
            new_path: PathBuf::from("/b"),
        };
        assert_eq!(fs_message(Errno::ENOENT, op.path(), op.dest()), "ENOENT: no such file or directory: /a -> /b");
        let op = FsOp::Stat { path: PathBuf::from("/missing") };
        assert_eq!(fs_message(Errno::ENOENT, op.path(), op.dest()), "ENOENT: no such file or directory: /missing");
        let op = FsOp::Close { fd: 99 };
        assert_eq!(fs_message(Errno::EBADF, op.path(), op.dest()), "EBADF: bad file descriptor");
    }
}

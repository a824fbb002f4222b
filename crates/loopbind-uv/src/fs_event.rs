//! Change-notification file watchers
//!
//! An fs_event handle asks the OS to report changes under a path (inotify,
//! FSEvents or kqueue through `notify`). Events arrive on the watcher's own
//! thread and are forwarded to the loop as wakeups; the callback then runs
//! on the loop thread with the name of the entry that changed.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Errno, UvResult};
use crate::event_loop::{Loop, Wakeup};
use crate::handle::{HandleId, HandleState, HandleType};

/// Report events for the watched entry only, not its children.
pub const FS_EVENT_WATCH_ENTRY: u32 = 1;
/// Accepted for compatibility. Change detection never falls back to stat.
pub const FS_EVENT_STAT: u32 = 2;
/// Watch subdirectories too.
pub const FS_EVENT_RECURSIVE: u32 = 4;

/// An entry was created, deleted or renamed.
pub const RENAME: u32 = 1;
/// An entry's contents or metadata changed.
pub const CHANGE: u32 = 2;

/// Event callback: status, name of the changed entry relative to the
/// watched path, and a mask of [`RENAME`]/[`CHANGE`].
pub type FsEventCb = fn(&Loop, HandleId, UvResult<()>, Option<&Path>, u32);

pub(crate) struct FsEventState {
    cb: Option<FsEventCb>,
    path: PathBuf,
    generation: u64,
    watcher: Option<RecommendedWatcher>,
}

/// One event as it crosses from the watcher thread to the loop.
pub(crate) struct FsEventMessage {
    pub(crate) handle: HandleId,
    pub(crate) generation: u64,
    pub(crate) outcome: UvResult<(Vec<PathBuf>, u32)>,
}

fn event_mask(kind: &EventKind) -> u32 {
    match kind {
        EventKind::Access(_) => 0,
        EventKind::Create(_) | EventKind::Remove(_) => RENAME,
        EventKind::Modify(ModifyKind::Name(_)) => RENAME,
        _ => CHANGE,
    }
}

fn errno_of(err: &notify::Error) -> Errno {
    match &err.kind {
        notify::ErrorKind::Io(io) => Errno::from_io(io),
        notify::ErrorKind::PathNotFound => Errno::ENOENT,
        notify::ErrorKind::MaxFilesWatch => Errno::ENOSPC,
        _ => Errno::EINVAL,
    }
}

/// Name reported for `changed`: relative to the watched directory, or the
/// entry's own name when the watched path is the entry itself.
fn relative_name(watched: &Path, changed: &Path) -> PathBuf {
    match changed.strip_prefix(watched) {
        Ok(rest) if !rest.as_os_str().is_empty() => rest.to_path_buf(),
        _ => changed
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| changed.to_path_buf()),
    }
}

impl Loop {
    /// Create an fs_event handle.
    pub fn fs_event_init(&self) -> HandleId {
        self.insert_handle(
            HandleType::FsEvent,
            HandleState::FsEvent(FsEventState {
                cb: None,
                path: PathBuf::new(),
                generation: 0,
                watcher: None,
            }),
        )
    }

    /// Start watching `path`. Fails with `EINVAL` if the handle is already
    /// active and with the OS error if the path cannot be watched.
    pub fn fs_event_start(&self, id: HandleId, cb: FsEventCb, path: PathBuf, flags: u32) -> UvResult<()> {
        let generation = self
            .with_handle(id, |rec| {
                if rec.is_closing() || rec.is_active() {
                    return Err(Errno::EINVAL);
                }
                match &rec.state {
                    HandleState::FsEvent(state) => Ok(state.generation + 1),
                    _ => Err(Errno::EINVAL),
                }
            })
            .ok_or(Errno::EBADF)??;

        let tx = self.wake_sender();
        let entry_only = flags & FS_EVENT_WATCH_ENTRY != 0;
        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let outcome = match res {
                Ok(event) => {
                    let mask = event_mask(&event.kind);
                    if mask == 0 {
                        return;
                    }
                    let paths: Vec<PathBuf> = event
                        .paths
                        .into_iter()
                        .filter(|p| !entry_only || p == &watched)
                        .collect();
                    if paths.is_empty() && entry_only {
                        return;
                    }
                    Ok((paths, mask))
                }
                Err(err) => Err(errno_of(&err)),
            };
            let _ = tx.send(Wakeup::FsEvent(FsEventMessage {
                handle: id,
                generation,
                outcome,
            }));
        })
        .map_err(|e| errno_of(&e))?;

        let mode = if flags & FS_EVENT_RECURSIVE != 0 {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&path, mode).map_err(|e| errno_of(&e))?;
        tracing::debug!(handle = %id, path = %path.display(), flags, "fs_event watching");

        self.with_handle(id, |rec| {
            if let HandleState::FsEvent(state) = &mut rec.state {
                state.cb = Some(cb);
                state.path = path;
                state.generation = generation;
                state.watcher = Some(watcher);
            }
            rec.set_active(true);
        });
        Ok(())
    }

    /// Stop watching. Events already queued are dropped.
    pub fn fs_event_stop(&self, id: HandleId) -> UvResult<()> {
        let watcher = self
            .with_handle(id, |rec| {
                let HandleState::FsEvent(state) = &mut rec.state else {
                    return Err(Errno::EINVAL);
                };
                state.generation += 1;
                let watcher = state.watcher.take();
                rec.set_active(false);
                Ok(watcher)
            })
            .ok_or(Errno::EBADF)??;
        // the watcher thread may still be forwarding; drop it outside the borrow
        drop(watcher);
        Ok(())
    }

    /// Path being watched. Fails with `EINVAL` if the handle is not active.
    pub fn fs_event_getpath(&self, id: HandleId) -> UvResult<PathBuf> {
        self.with_handle(id, |rec| match &rec.state {
            HandleState::FsEvent(state) if rec.is_active() => Ok(state.path.clone()),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    pub(crate) fn dispatch_fs_event(&self, message: FsEventMessage) {
        let FsEventMessage {
            handle: id,
            generation,
            outcome,
        } = message;
        let current = |lp: &Loop| {
            lp.with_handle(id, |rec| match &rec.state {
                HandleState::FsEvent(state) if rec.is_active() && state.generation == generation => {
                    state.cb.map(|cb| (cb, state.path.clone()))
                }
                _ => None,
            })
            .flatten()
        };
        let Some((cb, watched)) = current(self) else {
            return;
        };
        match outcome {
            Err(err) => cb(self, id, Err(err), None, 0),
            Ok((paths, mask)) if paths.is_empty() => cb(self, id, Ok(()), None, mask),
            Ok((paths, mask)) => {
                for changed in paths {
                    // the previous callback may have stopped the handle
                    if current(self).is_none() {
                        return;
                    }
                    let name = relative_name(&watched, &changed);
                    cb(self, id, Ok(()), Some(&name), mask);
                }
            }
        }
    }
}

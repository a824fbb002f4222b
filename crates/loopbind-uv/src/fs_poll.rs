//! Stat-polling file watchers
//!
//! An fs_poll handle stats its path on the pool every `interval`
//! milliseconds and reports when the result differs from the previous one.
//! The first successful stat only establishes the baseline. A failing stat
//! is reported once, when the error first appears or changes.

use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{Errno, UvResult};
use crate::event_loop::Loop;
use crate::fs::{FsOp, FsValue, Stat};
use crate::handle::{HandleId, HandleState, HandleType};
use crate::request::{Done, ReqType};
use crate::timer::TimerKey;

/// Change callback: status, previous stat, current stat. On error the
/// current stat is zeroed.
pub type FsPollCb = fn(&Loop, HandleId, UvResult<()>, &Stat, &Stat);

pub(crate) struct FsPollState {
    cb: Option<FsPollCb>,
    path: PathBuf,
    interval: u64,
    prev: Stat,
    // 0: no baseline yet, 1: last stat succeeded, <0: last error code.
    status: i32,
    generation: u64,
    tick: Option<TimerKey>,
}

// Attached to each stat request so stale results can be ignored.
struct Ticket {
    handle: HandleId,
    generation: u64,
}

impl Loop {
    /// Create an fs_poll handle.
    pub fn fs_poll_init(&self) -> HandleId {
        self.insert_handle(
            HandleType::FsPoll,
            HandleState::FsPoll(FsPollState {
                cb: None,
                path: PathBuf::new(),
                interval: 0,
                prev: Stat::default(),
                status: 0,
                generation: 0,
                tick: None,
            }),
        )
    }

    /// Start polling `path` every `interval` milliseconds. Starting an
    /// active handle is a no-op.
    pub fn fs_poll_start(&self, id: HandleId, cb: FsPollCb, path: PathBuf, interval: u64) -> UvResult<()> {
        let generation = self
            .with_handle(id, |rec| {
                if rec.is_closing() {
                    return Err(Errno::EINVAL);
                }
                let active = rec.is_active();
                let HandleState::FsPoll(state) = &mut rec.state else {
                    return Err(Errno::EINVAL);
                };
                if active {
                    return Ok(None);
                }
                state.cb = Some(cb);
                state.path = path;
                state.interval = interval.max(1);
                state.prev = Stat::default();
                state.status = 0;
                state.generation += 1;
                let generation = state.generation;
                rec.set_active(true);
                Ok(Some(generation))
            })
            .ok_or(Errno::EBADF)??;

        if let Some(generation) = generation {
            if let Err(err) = self.fs_poll_stat(id, generation) {
                self.with_handle(id, |rec| rec.set_active(false));
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop polling. Results still in flight are dropped.
    pub fn fs_poll_stop(&self, id: HandleId) -> UvResult<()> {
        let tick = self
            .with_handle(id, |rec| {
                let active = rec.is_active();
                let HandleState::FsPoll(state) = &mut rec.state else {
                    return Err(Errno::EINVAL);
                };
                if !active {
                    return Ok(None);
                }
                state.generation += 1;
                let tick = state.tick.take();
                rec.set_active(false);
                Ok(tick)
            })
            .ok_or(Errno::EBADF)??;
        if let Some(key) = tick {
            self.cancel_tick(key);
        }
        Ok(())
    }

    /// Path being polled. Fails with `EINVAL` if the handle is not active.
    pub fn fs_poll_getpath(&self, id: HandleId) -> UvResult<PathBuf> {
        self.with_handle(id, |rec| match &rec.state {
            HandleState::FsPoll(state) if rec.is_active() => Ok(state.path.clone()),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    fn fs_poll_stat(&self, id: HandleId, generation: u64) -> UvResult<()> {
        let path = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::FsPoll(state) => Some(state.path.clone()),
                _ => None,
            })
            .flatten()
            .ok_or(Errno::EINVAL)?;
        let ticket: Rc<dyn std::any::Any> = Rc::new(Ticket { handle: id, generation });
        self.submit(
            ReqType::Fs,
            Some(ticket),
            move || match (FsOp::Stat { path }).run()? {
                FsValue::Stat(stat) => Ok(stat),
                _ => Err(Errno::EIO),
            },
            fs_poll_done,
        )?;
        Ok(())
    }

    pub(crate) fn fs_poll_tick(&self, key: TimerKey) {
        let id = key.handle;
        let generation = self
            .with_handle(id, |rec| {
                let active = rec.is_active();
                match &mut rec.state {
                    HandleState::FsPoll(state) if active && state.tick == Some(key) => {
                        state.tick = None;
                        Some(state.generation)
                    }
                    _ => None,
                }
            })
            .flatten();
        let Some(generation) = generation else {
            return;
        };
        if let Err(err) = self.fs_poll_stat(id, generation) {
            tracing::warn!(handle = %id, %err, "fs_poll stat submission failed");
            self.fs_poll_report(id, generation, Err(err));
        }
    }

    fn fs_poll_report(&self, id: HandleId, generation: u64, result: UvResult<Stat>) {
        let outcome = self
            .with_handle(id, |rec| {
                let active = rec.is_active();
                let HandleState::FsPoll(state) = &mut rec.state else {
                    return None;
                };
                if !active || state.generation != generation {
                    return None;
                }
                let prev = state.prev;
                let notify = match &result {
                    Ok(stat) => {
                        let changed = state.status != 0 && (state.status < 0 || *stat != prev);
                        state.prev = *stat;
                        state.status = 1;
                        changed.then(|| (Ok(()), prev, *stat))
                    }
                    Err(err) => {
                        let changed = state.status != err.code();
                        state.status = err.code();
                        changed.then(|| (Err(*err), prev, Stat::default()))
                    }
                };
                Some((state.cb, notify, state.interval))
            })
            .flatten();

        let Some((cb, notify, interval)) = outcome else {
            return;
        };
        if let (Some(cb), Some((status, prev, curr))) = (cb, notify) {
            cb(self, id, status, &prev, &curr);
        }

        // The callback may have stopped or restarted the handle.
        let still_current = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::FsPoll(state) => rec.is_active() && state.generation == generation,
                _ => false,
            })
            .unwrap_or(false);
        if still_current {
            let key = self.schedule_tick(id, interval);
            self.with_handle(id, |rec| {
                if let HandleState::FsPoll(state) = &mut rec.state {
                    state.tick = Some(key);
                }
            });
        }
    }
}

fn fs_poll_done(lp: &Loop, done: Done<Stat>) {
    let Some(ticket) = done.data.as_ref().and_then(|d| d.downcast_ref::<Ticket>()) else {
        return;
    };
    lp.fs_poll_report(ticket.handle, ticket.generation, done.result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::RunMode;
    use std::cell::RefCell;

    thread_local! {
        static EVENTS: RefCell<Vec<(UvResult<()>, u64, u64)>> = RefCell::new(Vec::new());
    }

    fn on_change(lp: &Loop, id: HandleId, status: UvResult<()>, prev: &Stat, curr: &Stat) {
        EVENTS.with(|e| e.borrow_mut().push((status, prev.size, curr.size)));
        lp.close_handle(id, None).unwrap();
    }

    fn grow(lp: &Loop, id: HandleId) {
        let path = lp
            .handle_data(id)
            .and_then(|d| d.downcast_ref::<PathBuf>().cloned())
            .unwrap();
        std::fs::write(path, b"longer contents").unwrap();
        lp.close_handle(id, None).unwrap();
    }

    #[test]
    fn test_reports_change_after_baseline() {
        EVENTS.with(|e| e.borrow_mut().clear());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, b"x").unwrap();

        let lp = Loop::with_pool_size(1);
        let poll = lp.fs_poll_init();
        lp.fs_poll_start(poll, on_change, path.clone(), 5).unwrap();
        assert_eq!(lp.fs_poll_getpath(poll), Ok(path.clone()));

        let t = lp.timer_init();
        lp.set_handle_data(t, Some(Rc::new(path))).unwrap();
        lp.timer_start(t, grow, 30, 0).unwrap();

        lp.run(RunMode::Default);
        EVENTS.with(|e| assert_eq!(*e.borrow(), vec![(Ok(()), 1, 15)]));
    }

    #[test]
    fn test_missing_file_reports_error_once() {
        EVENTS.with(|e| e.borrow_mut().clear());
        let dir = tempfile::tempdir().unwrap();
        let lp = Loop::with_pool_size(1);
        let poll = lp.fs_poll_init();
        lp.fs_poll_start(poll, on_change, dir.path().join("absent"), 5)
            .unwrap();
        lp.run(RunMode::Default);
        EVENTS.with(|e| assert_eq!(*e.borrow(), vec![(Err(Errno::ENOENT), 0, 0)]));
    }

    #[test]
    fn test_getpath_requires_active() {
        let lp = Loop::with_pool_size(1);
        let poll = lp.fs_poll_init();
        assert_eq!(lp.fs_poll_getpath(poll), Err(Errno::EINVAL));
        assert!(lp.fs_poll_stop(poll).is_ok());
    }
}

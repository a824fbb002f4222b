//! Idle, prepare and check handles
//!
//! All three are the same watcher run at different points of an iteration:
//! idle and prepare before polling (an active idle handle makes the poll
//! non-blocking), check right after it.

use crate::error::{Errno, UvResult};
use crate::event_loop::{Loop, LoopState};
use crate::handle::{HandleId, HandleState, HandleType};

/// Watcher callback.
pub type WatcherCb = fn(&Loop, HandleId);

#[derive(Default)]
pub(crate) struct WatcherState {
    cb: Option<WatcherCb>,
}

fn queue_of(st: &mut LoopState, kind: HandleType) -> &mut Vec<HandleId> {
    match kind {
        HandleType::Idle => &mut st.idle,
        HandleType::Prepare => &mut st.prepare,
        _ => &mut st.check,
    }
}

macro_rules! loop_watcher {
    ($kind:expr, $init:ident, $start:ident, $stop:ident) => {
        impl Loop {
            #[doc = concat!("Create a handle of type `", stringify!($kind), "`.")]
            pub fn $init(&self) -> HandleId {
                self.insert_handle($kind, HandleState::Watcher(WatcherState::default()))
            }

            /// Start the watcher. Starting an active watcher is a no-op and
            /// keeps the original callback.
            pub fn $start(&self, id: HandleId, cb: WatcherCb) -> UvResult<()> {
                self.watcher_start($kind, id, cb)
            }

            /// Stop the watcher. Stopping an inactive watcher is a no-op.
            pub fn $stop(&self, id: HandleId) -> UvResult<()> {
                self.watcher_stop($kind, id)
            }
        }
    };
}

loop_watcher!(HandleType::Idle, idle_init, idle_start, idle_stop);
loop_watcher!(HandleType::Prepare, prepare_init, prepare_start, prepare_stop);
loop_watcher!(HandleType::Check, check_init, check_start, check_stop);

impl Loop {
    fn watcher_start(&self, kind: HandleType, id: HandleId, cb: WatcherCb) -> UvResult<()> {
        let mut st = self.state.borrow_mut();
        let rec = st.handles.get_mut(&id.0).ok_or(Errno::EBADF)?;
        if rec.kind != kind {
            return Err(Errno::EINVAL);
        }
        if rec.is_closing() {
            return Err(Errno::EINVAL);
        }
        if rec.is_active() {
            return Ok(());
        }
        if let HandleState::Watcher(watcher) = &mut rec.state {
            watcher.cb = Some(cb);
        }
        rec.set_active(true);
        queue_of(&mut st, kind).push(id);
        Ok(())
    }

    pub(crate) fn watcher_stop(&self, kind: HandleType, id: HandleId) -> UvResult<()> {
        let mut st = self.state.borrow_mut();
        let rec = st.handles.get_mut(&id.0).ok_or(Errno::EBADF)?;
        if rec.kind != kind {
            return Err(Errno::EINVAL);
        }
        if !rec.is_active() {
            return Ok(());
        }
        rec.set_active(false);
        queue_of(&mut st, kind).retain(|h| *h != id);
        Ok(())
    }

    pub(crate) fn run_watchers(&self, kind: HandleType) {
        let snapshot: Vec<HandleId> = queue_of(&mut self.state.borrow_mut(), kind).clone();
        for id in snapshot {
            // A callback earlier in this pass may have stopped or closed it.
            let cb = self
                .with_handle(id, |rec| match &rec.state {
                    HandleState::Watcher(w) if rec.is_active() => w.cb,
                    _ => None,
                })
                .flatten();
            if let Some(cb) = cb {
                cb(self, id);
            }
        }
    }
}

//! Handle identities, type tags and per-handle bookkeeping

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::async_handle::AsyncState;
use crate::event_loop::Loop;
use crate::fs_event::FsEventState;
use crate::fs_poll::FsPollState;
use crate::signal::SignalState;
use crate::timer::TimerState;
use crate::watcher::WatcherState;

/// Identity of a handle within its loop. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    /// Raw id, stable for the lifetime of the loop.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    Async,
    Check,
    FsEvent,
    FsPoll,
    Idle,
    Prepare,
    Signal,
    Timer,
}

impl HandleType {
    /// Name as reported by the loop (`"timer"`, `"fs_poll"`, ...).
    pub fn name(self) -> &'static str {
        match self {
            HandleType::Async => "async",
            HandleType::Check => "check",
            HandleType::FsEvent => "fs_event",
            HandleType::FsPoll => "fs_poll",
            HandleType::Idle => "idle",
            HandleType::Prepare => "prepare",
            HandleType::Signal => "signal",
            HandleType::Timer => "timer",
        }
    }

    /// Numeric tag, matching libuv's `uv_handle_type`.
    pub fn code(self) -> i32 {
        match self {
            HandleType::Async => 1,
            HandleType::Check => 2,
            HandleType::FsEvent => 3,
            HandleType::FsPoll => 4,
            HandleType::Idle => 6,
            HandleType::Prepare => 9,
            HandleType::Timer => 13,
            HandleType::Signal => 16,
        }
    }
}

pub(crate) const HANDLE_ACTIVE: u32 = 1 << 0;
pub(crate) const HANDLE_REF: u32 = 1 << 1;
pub(crate) const HANDLE_CLOSING: u32 = 1 << 2;
pub(crate) const HANDLE_CLOSED: u32 = 1 << 3;

/// Called once the loop has finished closing a handle. This is the last
/// time the handle id is valid.
pub type CloseCb = fn(&Loop, HandleId);

/// Type-specific state.
pub(crate) enum HandleState {
    Timer(TimerState),
    Watcher(WatcherState),
    Async(AsyncState),
    Signal(SignalState),
    FsPoll(FsPollState),
    FsEvent(FsEventState),
}

pub(crate) struct HandleRecord {
    pub(crate) kind: HandleType,
    pub(crate) flags: u32,
    pub(crate) data: Option<Rc<dyn Any>>,
    pub(crate) close_cb: Option<CloseCb>,
    pub(crate) state: HandleState,
}

impl HandleRecord {
    pub(crate) fn new(kind: HandleType, state: HandleState) -> Self {
        Self {
            kind,
            flags: HANDLE_REF,
            data: None,
            close_cb: None,
            state,
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.flags & HANDLE_ACTIVE != 0
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.flags & (HANDLE_CLOSING | HANDLE_CLOSED) != 0
    }

    /// Counts toward loop liveness.
    #[inline]
    pub(crate) fn keeps_alive(&self) -> bool {
        self.flags & (HANDLE_ACTIVE | HANDLE_REF) == (HANDLE_ACTIVE | HANDLE_REF)
            && !self.is_closing()
    }

    #[inline]
    pub(crate) fn set_active(&mut self, active: bool) {
        if active {
            self.flags |= HANDLE_ACTIVE;
        } else {
            self.flags &= !HANDLE_ACTIVE;
        }
    }
}

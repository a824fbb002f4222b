//! The event loop
//!
//! One `Loop` owns every handle and request created on it and is driven from
//! a single thread. Other threads (the blocking-work pool, the signal
//! forwarder, async senders) only ever talk to it through the wakeup channel.
//!
//! Iteration order follows libuv: timers, idle, prepare, poll, check, then
//! close callbacks. No `RefCell` borrow is held while a user callback runs,
//! so callbacks may freely call back into the loop.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::error::{Errno, UvResult};
use crate::fs_event::FsEventMessage;
use crate::handle::{
    CloseCb, HandleId, HandleRecord, HandleState, HandleType, HANDLE_CLOSED, HANDLE_CLOSING,
    HANDLE_REF,
};
use crate::request::{ReqId, RequestRecord};
use crate::threadpool::{self, Job, ThreadPool};
use crate::timer::TimerKey;

static NEXT_LOOP_TOKEN: AtomicU64 = AtomicU64::new(1);
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since an arbitrary process-wide origin.
pub fn hrtime() -> u64 {
    PROCESS_START.elapsed().as_nanos() as u64
}

// ============================================================================
// Run modes and wakeups
// ============================================================================

/// How long [`Loop::run`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until nothing keeps the loop alive or `stop` is called.
    Default,
    /// One iteration, blocking for I/O if there is nothing pending.
    Once,
    /// One iteration without blocking.
    NoWait,
}

impl RunMode {
    /// Mode name as used by scripts.
    pub fn name(self) -> &'static str {
        match self {
            RunMode::Default => "default",
            RunMode::Once => "once",
            RunMode::NoWait => "nowait",
        }
    }

    /// Parse a mode name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(RunMode::Default),
            "once" => Some(RunMode::Once),
            "nowait" => Some(RunMode::NoWait),
            _ => None,
        }
    }
}

/// Message delivered to the loop thread.
pub(crate) enum Wakeup {
    /// An async handle was signalled.
    Async(HandleId),
    /// A process signal arrived.
    Signal(i32),
    /// A file watcher saw a change.
    FsEvent(FsEventMessage),
    /// A pool job finished (or was cancelled before it ran).
    Done {
        req: ReqId,
        outcome: UvResult<Box<dyn Any + Send>>,
    },
}

/// Loop counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Completed loop iterations.
    pub loop_count: u64,
    /// Events processed by the poll phase.
    pub events: u64,
    /// Events still queued when the last poll phase ended.
    pub events_waiting: u64,
}

// ============================================================================
// Loop state
// ============================================================================

pub(crate) struct LoopState {
    next_id: u64,
    pub(crate) handles: BTreeMap<u64, HandleRecord>,
    pub(crate) timers: BTreeSet<TimerKey>,
    pub(crate) timer_seq: u64,
    pub(crate) idle: Vec<HandleId>,
    pub(crate) prepare: Vec<HandleId>,
    pub(crate) check: Vec<HandleId>,
    pub(crate) closing: VecDeque<HandleId>,
    pub(crate) requests: FxHashMap<u64, RequestRecord>,
    pub(crate) signals: FxHashMap<i32, usize>,
}

impl LoopState {
    fn new() -> Self {
        Self {
            next_id: 1,
            handles: BTreeMap::new(),
            timers: BTreeSet::new(),
            timer_seq: 0,
            idle: Vec::with_capacity(8),
            prepare: Vec::with_capacity(8),
            check: Vec::with_capacity(8),
            closing: VecDeque::with_capacity(16),
            requests: FxHashMap::default(),
            signals: FxHashMap::default(),
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn has_active_handles(&self) -> bool {
        self.handles.values().any(HandleRecord::keeps_alive)
    }
}

/// Single-threaded event loop.
pub struct Loop {
    pub(crate) state: RefCell<LoopState>,
    data: RefCell<Option<Rc<dyn Any>>>,
    pub(crate) wake_tx: Sender<Wakeup>,
    wake_rx: Receiver<Wakeup>,
    pool: RefCell<Option<ThreadPool>>,
    pool_size: usize,
    stop_flag: Cell<bool>,
    origin: Instant,
    time: Cell<u64>,
    idle_time: Cell<Duration>,
    metrics: Cell<Metrics>,
    pub(crate) token: u64,
}

impl Loop {
    /// Create a loop whose pool size comes from `UV_THREADPOOL_SIZE`.
    pub fn new() -> Self {
        Self::with_pool_size(threadpool::default_pool_size())
    }

    /// Create a loop with an explicit pool size (clamped to the pool limits).
    pub fn with_pool_size(size: usize) -> Self {
        let (wake_tx, wake_rx) = channel::unbounded();
        Self {
            state: RefCell::new(LoopState::new()),
            data: RefCell::new(None),
            wake_tx,
            wake_rx,
            pool: RefCell::new(None),
            pool_size: threadpool::clamp_pool_size(size),
            stop_flag: Cell::new(false),
            origin: Instant::now(),
            time: Cell::new(0),
            idle_time: Cell::new(Duration::ZERO),
            metrics: Cell::new(Metrics::default()),
            token: NEXT_LOOP_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of worker threads the pool runs with.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Loop user data.
    pub fn data(&self) -> Option<Rc<dyn Any>> {
        self.data.borrow().clone()
    }

    /// Replace the loop user data.
    pub fn set_data(&self, data: Option<Rc<dyn Any>>) {
        *self.data.borrow_mut() = data;
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    /// Cached loop time in milliseconds, updated at the start of each iteration.
    pub fn now(&self) -> u64 {
        self.time.get()
    }

    /// Refresh the cached loop time.
    pub fn update_time(&self) {
        self.time.set(self.origin.elapsed().as_millis() as u64);
    }

    /// Total time spent blocked in the poll phase.
    pub fn idle_time(&self) -> Duration {
        self.idle_time.get()
    }

    /// Loop counters.
    pub fn metrics(&self) -> Metrics {
        self.metrics.get()
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Whether any referenced active handle, pending request or closing
    /// handle remains.
    pub fn alive(&self) -> bool {
        let st = self.state.borrow();
        st.has_active_handles() || !st.requests.is_empty() || !st.closing.is_empty()
    }

    /// Make the current (or next) `run` return after this iteration.
    pub fn stop(&self) {
        self.stop_flag.set(true);
    }

    /// Poll timeout in milliseconds, `-1` for "block indefinitely".
    pub fn backend_timeout(&self) -> i64 {
        match self.poll_timeout() {
            Some(ms) => ms as i64,
            None => -1,
        }
    }

    /// Run the loop. Returns whether it is still alive.
    pub fn run(&self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag.get() {
            self.update_time();
            self.run_timers();
            self.run_watchers(HandleType::Idle);
            self.run_watchers(HandleType::Prepare);

            let timeout = match mode {
                RunMode::NoWait => Some(0),
                RunMode::Once | RunMode::Default => self.poll_timeout(),
            };
            self.poll(timeout);

            self.run_watchers(HandleType::Check);
            self.run_closing();

            let mut metrics = self.metrics.get();
            metrics.loop_count += 1;
            self.metrics.set(metrics);

            if mode == RunMode::Once {
                self.update_time();
                self.run_timers();
            }

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }

        self.stop_flag.set(false);
        alive
    }

    fn poll_timeout(&self) -> Option<u64> {
        if self.stop_flag.get() {
            return Some(0);
        }
        let st = self.state.borrow();
        if !st.has_active_handles() && st.requests.is_empty() {
            return Some(0);
        }
        if !st.idle.is_empty() || !st.closing.is_empty() {
            return Some(0);
        }
        st.timers
            .first()
            .map(|key| key.due.saturating_sub(self.time.get()))
    }

    fn poll(&self, timeout: Option<u64>) {
        let started = Instant::now();
        let first = match timeout {
            Some(0) => self.wake_rx.try_recv().ok(),
            Some(ms) => self.wake_rx.recv_timeout(Duration::from_millis(ms)).ok(),
            None => self.wake_rx.recv().ok(),
        };
        if timeout != Some(0) {
            self.idle_time.set(self.idle_time.get() + started.elapsed());
        }

        let mut events = 0u64;
        if let Some(wakeup) = first {
            self.dispatch(wakeup);
            events += 1;
            // Only drain what was queued when polling started; a chatty
            // sender must not starve the other phases.
            let queued = self.wake_rx.len();
            for _ in 0..queued {
                match self.wake_rx.try_recv() {
                    Ok(wakeup) => {
                        self.dispatch(wakeup);
                        events += 1;
                    }
                    Err(_) => break,
                }
            }
        }

        let mut metrics = self.metrics.get();
        metrics.events += events;
        metrics.events_waiting = self.wake_rx.len() as u64;
        self.metrics.set(metrics);
    }

    fn dispatch(&self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Async(id) => self.dispatch_async(id),
            Wakeup::Signal(signum) => self.dispatch_signal(signum),
            Wakeup::FsEvent(message) => self.dispatch_fs_event(message),
            Wakeup::Done { req, outcome } => self.complete_request(req, outcome),
        }
    }

    fn run_closing(&self) {
        let closing: Vec<HandleId> = self.state.borrow_mut().closing.drain(..).collect();
        for id in closing {
            let cb = {
                let mut st = self.state.borrow_mut();
                match st.handles.get_mut(&id.0) {
                    Some(rec) => {
                        rec.flags |= HANDLE_CLOSED;
                        rec.close_cb.take()
                    }
                    None => continue,
                }
            };
            if let Some(cb) = cb {
                cb(self, id);
            }
            let record = self.state.borrow_mut().handles.remove(&id.0);
            drop(record);
        }
    }

    /// Close the loop. Fails with `EBUSY` while handles or requests remain.
    pub fn close(&self) -> UvResult<()> {
        {
            let st = self.state.borrow();
            if !st.handles.is_empty() || !st.requests.is_empty() {
                return Err(Errno::EBUSY);
            }
        }
        self.shutdown_pool();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Generic handle operations
    // ------------------------------------------------------------------------

    pub(crate) fn insert_handle(&self, kind: HandleType, state: HandleState) -> HandleId {
        let mut st = self.state.borrow_mut();
        let id = HandleId(st.next_id());
        st.handles.insert(id.0, HandleRecord::new(kind, state));
        id
    }

    pub(crate) fn with_handle<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut HandleRecord) -> R,
    ) -> Option<R> {
        self.state.borrow_mut().handles.get_mut(&id.0).map(f)
    }

    /// Request asynchronous closure. `cb` runs in the closing phase of the
    /// current or next iteration, after which the id is gone.
    pub fn close_handle(&self, id: HandleId, cb: Option<CloseCb>) -> UvResult<()> {
        let kind = {
            let mut st = self.state.borrow_mut();
            let rec = st.handles.get_mut(&id.0).ok_or(Errno::EBADF)?;
            if rec.is_closing() {
                return Err(Errno::EINVAL);
            }
            rec.flags |= HANDLE_CLOSING;
            rec.close_cb = cb;
            rec.kind
        };

        match kind {
            HandleType::Timer => self.timer_stop(id)?,
            HandleType::Idle | HandleType::Prepare | HandleType::Check => {
                self.watcher_stop(kind, id)?
            }
            HandleType::Async => self.async_close(id),
            HandleType::Signal => self.signal_stop(id)?,
            HandleType::FsPoll => self.fs_poll_stop(id)?,
            HandleType::FsEvent => self.fs_event_stop(id)?,
        }

        let mut st = self.state.borrow_mut();
        if let Some(rec) = st.handles.get_mut(&id.0) {
            rec.set_active(false);
        }
        st.closing.push_back(id);
        tracing::trace!(handle = %id, kind = kind.name(), "closing handle");
        Ok(())
    }

    /// Whether the handle is active. Closed handles are not.
    pub fn is_active(&self, id: HandleId) -> bool {
        self.with_handle(id, |rec| rec.is_active()).unwrap_or(false)
    }

    /// Whether close has been requested. Handles that no longer exist count
    /// as closing.
    pub fn is_closing(&self, id: HandleId) -> bool {
        self.with_handle(id, |rec| rec.is_closing()).unwrap_or(true)
    }

    /// Make the handle count toward loop liveness again.
    pub fn ref_handle(&self, id: HandleId) {
        self.with_handle(id, |rec| rec.flags |= HANDLE_REF);
    }

    /// Stop the handle from keeping the loop alive.
    pub fn unref_handle(&self, id: HandleId) {
        self.with_handle(id, |rec| rec.flags &= !HANDLE_REF);
    }

    /// Whether the handle is referenced.
    pub fn has_ref(&self, id: HandleId) -> bool {
        self.with_handle(id, |rec| rec.flags & HANDLE_REF != 0)
            .unwrap_or(false)
    }

    /// Type tag, `None` once the handle is gone.
    pub fn handle_type(&self, id: HandleId) -> Option<HandleType> {
        self.with_handle(id, |rec| rec.kind)
    }

    /// Handle user data.
    pub fn handle_data(&self, id: HandleId) -> Option<Rc<dyn Any>> {
        self.with_handle(id, |rec| rec.data.clone()).flatten()
    }

    /// Replace the handle user data.
    pub fn set_handle_data(&self, id: HandleId, data: Option<Rc<dyn Any>>) -> UvResult<()> {
        let previous = self
            .with_handle(id, |rec| std::mem::replace(&mut rec.data, data))
            .ok_or(Errno::EBADF)?;
        drop(previous);
        Ok(())
    }

    /// Visit every handle that has not finished closing, in creation order.
    pub fn walk(&self, mut f: impl FnMut(HandleId, HandleType)) {
        let handles: Vec<(HandleId, HandleType)> = self
            .state
            .borrow()
            .handles
            .iter()
            .filter(|(_, rec)| rec.flags & HANDLE_CLOSED == 0)
            .map(|(id, rec)| (HandleId(*id), rec.kind))
            .collect();
        for (id, kind) in handles {
            f(id, kind);
        }
    }

    /// Number of handles the loop still tracks, closing ones included.
    pub fn handle_count(&self) -> usize {
        self.state.borrow().handles.len()
    }

    // ------------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------------

    pub(crate) fn submit_job(&self, job: Job) -> UvResult<()> {
        let mut pool = self.pool.borrow_mut();
        if pool.is_none() {
            *pool = Some(ThreadPool::start(self.pool_size)?);
        }
        match pool.as_ref() {
            Some(pool) => pool.submit(job),
            None => Err(Errno::EAGAIN),
        }
    }

    pub(crate) fn wake_sender(&self) -> Sender<Wakeup> {
        self.wake_tx.clone()
    }

    /// Stop the worker threads, waiting for running jobs to finish. Queued
    /// jobs still complete as cancelled on the next poll.
    pub fn shutdown_pool(&self) {
        let pool = self.pool.borrow_mut().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

impl Default for Loop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.shutdown_pool();
        self.unregister_signals();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_loop_is_not_alive() {
        let lp = Loop::with_pool_size(1);
        assert!(!lp.alive());
        assert!(!lp.run(RunMode::Default));
        assert_eq!(lp.backend_timeout(), 0);
    }

    #[test]
    fn test_run_mode_names() {
        for mode in [RunMode::Default, RunMode::Once, RunMode::NoWait] {
            assert_eq!(RunMode::from_name(mode.name()), Some(mode));
        }
        assert_eq!(RunMode::from_name("forever"), None);
    }

    #[test]
    fn test_loop_data_round_trip() {
        let lp = Loop::with_pool_size(1);
        lp.set_data(Some(Rc::new(7u32)));
        let data = lp.data().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn test_close_empty_loop() {
        let lp = Loop::with_pool_size(1);
        assert!(lp.close().is_ok());
    }

    #[test]
    fn test_hrtime_monotonic() {
        let a = hrtime();
        let b = hrtime();
        assert!(b >= a);
    }
}

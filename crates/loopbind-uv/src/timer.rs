//! Timers
//!
//! Due timers are kept in an ordered set keyed by `(due, seq)` so that
//! timers with the same deadline fire in start order.

use crate::error::{Errno, UvResult};
use crate::event_loop::Loop;
use crate::handle::{HandleId, HandleState, HandleType};

/// Timer callback.
pub type TimerCb = fn(&Loop, HandleId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) due: u64,
    pub(crate) seq: u64,
    pub(crate) handle: HandleId,
}

#[derive(Default)]
pub(crate) struct TimerState {
    cb: Option<TimerCb>,
    due: u64,
    repeat: u64,
    key: Option<TimerKey>,
}

impl Loop {
    /// Create a timer handle.
    pub fn timer_init(&self) -> HandleId {
        self.insert_handle(HandleType::Timer, HandleState::Timer(TimerState::default()))
    }

    /// Start the timer. `timeout` and `repeat` are in milliseconds; a
    /// non-zero `repeat` re-arms the timer after each expiry.
    pub fn timer_start(&self, id: HandleId, cb: TimerCb, timeout: u64, repeat: u64) -> UvResult<()> {
        if self.is_closing(id) {
            return Err(Errno::EINVAL);
        }
        self.timer_stop(id)?;
        let due = self.now().saturating_add(timeout);
        let mut st = self.state.borrow_mut();
        st.timer_seq += 1;
        let key = TimerKey {
            due,
            seq: st.timer_seq,
            handle: id,
        };
        let rec = st.handles.get_mut(&id.0).ok_or(Errno::EBADF)?;
        let HandleState::Timer(timer) = &mut rec.state else {
            return Err(Errno::EINVAL);
        };
        timer.cb = Some(cb);
        timer.due = due;
        timer.repeat = repeat;
        timer.key = Some(key);
        rec.set_active(true);
        st.timers.insert(key);
        Ok(())
    }

    /// Stop the timer. Stopping an inactive timer is a no-op.
    pub fn timer_stop(&self, id: HandleId) -> UvResult<()> {
        let mut st = self.state.borrow_mut();
        let rec = st.handles.get_mut(&id.0).ok_or(Errno::EBADF)?;
        let HandleState::Timer(timer) = &mut rec.state else {
            return Err(Errno::EINVAL);
        };
        let key = timer.key.take();
        rec.set_active(false);
        if let Some(key) = key {
            st.timers.remove(&key);
        }
        Ok(())
    }

    /// Restart a repeating timer using its repeat value as the timeout.
    /// Fails with `EINVAL` if the timer was never started.
    pub fn timer_again(&self, id: HandleId) -> UvResult<()> {
        let (cb, repeat) = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::Timer(timer) => Ok((timer.cb, timer.repeat)),
                _ => Err(Errno::EINVAL),
            })
            .ok_or(Errno::EBADF)??;
        let cb = cb.ok_or(Errno::EINVAL)?;
        if repeat > 0 {
            self.timer_stop(id)?;
            self.timer_start(id, cb, repeat, repeat)?;
        }
        Ok(())
    }

    /// Change the repeat interval; takes effect at the next expiry.
    pub fn timer_set_repeat(&self, id: HandleId, repeat: u64) -> UvResult<()> {
        self.with_handle(id, |rec| match &mut rec.state {
            HandleState::Timer(timer) => {
                timer.repeat = repeat;
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    /// Repeat interval in milliseconds.
    pub fn timer_get_repeat(&self, id: HandleId) -> UvResult<u64> {
        self.with_handle(id, |rec| match &rec.state {
            HandleState::Timer(timer) => Ok(timer.repeat),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    /// Milliseconds until expiry, 0 if inactive or already due.
    pub fn timer_get_due_in(&self, id: HandleId) -> UvResult<u64> {
        let now = self.now();
        self.with_handle(id, |rec| match &rec.state {
            HandleState::Timer(timer) if rec.is_active() => Ok(timer.due.saturating_sub(now)),
            HandleState::Timer(_) => Ok(0),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    /// Schedule an internal tick for a non-timer handle (fs_poll).
    pub(crate) fn schedule_tick(&self, id: HandleId, delay: u64) -> TimerKey {
        let mut st = self.state.borrow_mut();
        st.timer_seq += 1;
        let key = TimerKey {
            due: self.now().saturating_add(delay),
            seq: st.timer_seq,
            handle: id,
        };
        st.timers.insert(key);
        key
    }

    pub(crate) fn cancel_tick(&self, key: TimerKey) {
        self.state.borrow_mut().timers.remove(&key);
    }

    pub(crate) fn run_timers(&self) {
        let now = self.now();
        // Snapshot first: timers started from a callback wait for the next
        // iteration even with a zero timeout.
        let expired: Vec<TimerKey> = self
            .state
            .borrow()
            .timers
            .iter()
            .take_while(|key| key.due <= now)
            .copied()
            .collect();

        for key in expired {
            if !self.state.borrow_mut().timers.remove(&key) {
                continue;
            }
            match self.handle_type(key.handle) {
                Some(HandleType::Timer) => self.expire_timer(key, now),
                Some(HandleType::FsPoll) => self.fs_poll_tick(key),
                _ => {}
            }
        }
    }

    fn expire_timer(&self, key: TimerKey, now: u64) {
        let cb = {
            let mut st = self.state.borrow_mut();
            let Some(rec) = st.handles.get_mut(&key.handle.0) else {
                return;
            };
            let HandleState::Timer(timer) = &mut rec.state else {
                return;
            };
            if timer.key != Some(key) {
                return;
            }
            let cb = timer.cb;
            let next = if timer.repeat > 0 {
                let next = TimerKey {
                    due: now.saturating_add(timer.repeat),
                    seq: key.seq,
                    handle: key.handle,
                };
                timer.due = next.due;
                timer.key = Some(next);
                Some(next)
            } else {
                timer.key = None;
                None
            };
            match next {
                Some(next) => {
                    st.timers.insert(next);
                }
                None => rec.set_active(false),
            }
            cb
        };

        // Re-armed or stopped before the callback runs, so a stop() inside
        // the callback sticks.
        if let Some(cb) = cb {
            cb(self, key.handle);
        }
    }
}

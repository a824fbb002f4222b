//! Async handles: wake the loop from any thread
//!
//! Sends coalesce. However many times `send` is called before the loop gets
//! around to it, the callback runs once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::error::{Errno, UvResult};
use crate::event_loop::{Loop, Wakeup};
use crate::handle::{HandleId, HandleState, HandleType};

/// Async callback.
pub type AsyncCb = fn(&Loop, HandleId);

pub(crate) struct AsyncState {
    cb: AsyncCb,
    pending: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

/// Thread-safe sender for one async handle.
#[derive(Clone)]
pub struct AsyncSender {
    handle: HandleId,
    pending: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    tx: Sender<Wakeup>,
}

impl AsyncSender {
    /// Wake the owning loop. Fails with `EINVAL` once the handle is closing.
    pub fn send(&self) -> UvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Errno::EINVAL);
        }
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.tx
                .send(Wakeup::Async(self.handle))
                .map_err(|_| Errno::EPIPE)?;
        }
        Ok(())
    }

    /// Handle this sender wakes.
    pub fn handle(&self) -> HandleId {
        self.handle
    }
}

impl Loop {
    /// Create an async handle. It is active immediately.
    pub fn async_init(&self, cb: AsyncCb) -> HandleId {
        let state = AsyncState {
            cb,
            pending: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let id = self.insert_handle(HandleType::Async, HandleState::Async(state));
        self.with_handle(id, |rec| rec.set_active(true));
        id
    }

    /// Sender that can be moved to other threads.
    pub fn async_sender(&self, id: HandleId) -> UvResult<AsyncSender> {
        let tx = self.wake_sender();
        self.with_handle(id, |rec| match &rec.state {
            HandleState::Async(state) => Ok(AsyncSender {
                handle: id,
                pending: state.pending.clone(),
                closed: state.closed.clone(),
                tx,
            }),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    /// Signal an async handle from the loop thread.
    pub fn async_send(&self, id: HandleId) -> UvResult<()> {
        self.async_sender(id)?.send()
    }

    pub(crate) fn async_close(&self, id: HandleId) {
        self.with_handle(id, |rec| {
            if let HandleState::Async(state) = &rec.state {
                state.closed.store(true, Ordering::Release);
            }
        });
    }

    pub(crate) fn dispatch_async(&self, id: HandleId) {
        let cb = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::Async(state) if !rec.is_closing() => {
                    state.pending.store(false, Ordering::Release);
                    Some(state.cb)
                }
                _ => None,
            })
            .flatten();
        if let Some(cb) = cb {
            cb(self, id);
        }
    }
}

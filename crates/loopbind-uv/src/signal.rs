//! Signal handles
//!
//! Process signals are funnelled through a self-pipe: the installed handler
//! writes the signal number to a pipe, and a forwarder thread fans it out to
//! every loop watching that signal. The handler is installed when the first
//! watcher (in any loop) starts and the default disposition is restored when
//! the last one stops.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::Sender;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{check, Errno, UvResult};
use crate::event_loop::{Loop, Wakeup};
use crate::handle::{HandleId, HandleState, HandleType};

/// Signal callback; receives the signal number.
pub type SignalCb = fn(&Loop, HandleId, i32);

/// Highest signal number accepted.
pub const MAX_SIGNAL: i32 = 64;

pub(crate) struct SignalState {
    cb: Option<SignalCb>,
    signum: i32,
    oneshot: bool,
}

// ============================================================================
// Process-wide hub
// ============================================================================

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

type Watchers = DashMap<i32, Vec<(u64, Sender<Wakeup>)>>;

struct SignalHub {
    watchers: Arc<Watchers>,
    // Serializes handler installation with watcher registration.
    install: Mutex<()>,
}

static HUB: Lazy<Result<SignalHub, Errno>> = Lazy::new(SignalHub::start);

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "netbsd", target_os = "openbsd")))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = signum as u8;
    // SAFETY: write(2) is async-signal-safe and the buffer is a local byte.
    // The interrupted code's errno is put back before returning.
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        loop {
            let n = libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            // a full pipe already holds a wakeup for the forwarder
            if n >= 0 || *errno != libc::EINTR {
                break;
            }
        }
        *errno = saved;
    }
}

fn set_disposition(signum: i32, handler: libc::sighandler_t) -> UvResult<()> {
    // SAFETY: the sigaction struct is fully initialized before use and the
    // handler only performs async-signal-safe work.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        check(libc::sigaction(signum, &sa, std::ptr::null_mut()))?;
    }
    Ok(())
}

impl SignalHub {
    fn start() -> Result<SignalHub, Errno> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe(2) writes.
        unsafe {
            check(libc::pipe(fds.as_mut_ptr()))?;
            for fd in fds {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            // the handler must never block on a full pipe
            let flags = libc::fcntl(fds[1], libc::F_GETFL);
            check(libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        }
        let [read_fd, write_fd] = fds;

        let watchers: Arc<Watchers> = Arc::new(DashMap::new());
        let forward_to = watchers.clone();
        thread::Builder::new()
            .name("uv-signal".to_string())
            .spawn(move || forward(read_fd, &forward_to))
            .map_err(|e| Errno::from_io(&e))?;

        WRITE_FD.store(write_fd, Ordering::Release);
        Ok(SignalHub {
            watchers,
            install: Mutex::new(()),
        })
    }

    fn register(&self, signum: i32, token: u64, tx: Sender<Wakeup>) -> UvResult<()> {
        let _guard = self.install.lock();
        let first = !self.watchers.contains_key(&signum);
        if first {
            set_disposition(signum, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t)?;
            tracing::debug!(signum, "installed signal handler");
        }
        self.watchers.entry(signum).or_default().push((token, tx));
        Ok(())
    }

    fn unregister(&self, signum: i32, token: u64) {
        let _guard = self.install.lock();
        let now_empty = match self.watchers.get_mut(&signum) {
            Some(mut list) => {
                list.retain(|(t, _)| *t != token);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.watchers.remove(&signum);
            if let Err(err) = set_disposition(signum, libc::SIG_DFL) {
                tracing::warn!(signum, %err, "failed to restore default signal disposition");
            }
        }
    }
}

fn forward(read_fd: libc::c_int, watchers: &Watchers) {
    let mut byte = 0u8;
    loop {
        // SAFETY: reading one byte into a local buffer.
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            let signum = byte as i32;
            if let Some(list) = watchers.get(&signum) {
                for (_, tx) in list.iter() {
                    let _ = tx.send(Wakeup::Signal(signum));
                }
            }
        } else if n < 0 && Errno::last_os_error() == Errno::EINTR {
            continue;
        } else {
            tracing::warn!("signal pipe closed, forwarder exiting");
            return;
        }
    }
}

fn hub() -> UvResult<&'static SignalHub> {
    HUB.as_ref().map_err(|e| *e)
}

// ============================================================================
// Loop integration
// ============================================================================

impl Loop {
    /// Create a signal handle.
    pub fn signal_init(&self) -> HandleId {
        self.insert_handle(
            HandleType::Signal,
            HandleState::Signal(SignalState {
                cb: None,
                signum: 0,
                oneshot: false,
            }),
        )
    }

    /// Watch `signum` until stopped.
    pub fn signal_start(&self, id: HandleId, cb: SignalCb, signum: i32) -> UvResult<()> {
        self.signal_start_inner(id, cb, signum, false)
    }

    /// Watch `signum` for a single delivery.
    pub fn signal_start_oneshot(&self, id: HandleId, cb: SignalCb, signum: i32) -> UvResult<()> {
        self.signal_start_inner(id, cb, signum, true)
    }

    fn signal_start_inner(&self, id: HandleId, cb: SignalCb, signum: i32, oneshot: bool) -> UvResult<()> {
        if signum <= 0 || signum > MAX_SIGNAL {
            return Err(Errno::EINVAL);
        }
        let (closing, active, current) = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::Signal(state) => Ok((rec.is_closing(), rec.is_active(), state.signum)),
                _ => Err(Errno::EINVAL),
            })
            .ok_or(Errno::EBADF)??;
        if closing {
            return Err(Errno::EINVAL);
        }

        if active && current == signum {
            self.with_handle(id, |rec| {
                if let HandleState::Signal(state) = &mut rec.state {
                    state.cb = Some(cb);
                    state.oneshot = oneshot;
                }
            });
            return Ok(());
        }
        if active {
            self.signal_stop(id)?;
        }

        self.watch_signal(signum)?;
        self.with_handle(id, |rec| {
            if let HandleState::Signal(state) = &mut rec.state {
                state.cb = Some(cb);
                state.signum = signum;
                state.oneshot = oneshot;
            }
            rec.set_active(true);
        });
        Ok(())
    }

    /// Stop watching. Stopping an inactive handle is a no-op.
    pub fn signal_stop(&self, id: HandleId) -> UvResult<()> {
        let signum = self
            .with_handle(id, |rec| match &rec.state {
                HandleState::Signal(state) if rec.is_active() => Ok(Some(state.signum)),
                HandleState::Signal(_) => Ok(None),
                _ => Err(Errno::EINVAL),
            })
            .ok_or(Errno::EBADF)??;
        if let Some(signum) = signum {
            self.with_handle(id, |rec| rec.set_active(false));
            self.unwatch_signal(signum);
        }
        Ok(())
    }

    /// Signal number the handle watches, 0 if never started.
    pub fn signal_signum(&self, id: HandleId) -> UvResult<i32> {
        self.with_handle(id, |rec| match &rec.state {
            HandleState::Signal(state) => Ok(state.signum),
            _ => Err(Errno::EINVAL),
        })
        .ok_or(Errno::EBADF)?
    }

    fn watch_signal(&self, signum: i32) -> UvResult<()> {
        let first = {
            let mut st = self.state.borrow_mut();
            let count = st.signals.entry(signum).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            if let Err(err) = hub().and_then(|hub| hub.register(signum, self.token, self.wake_sender())) {
                self.state.borrow_mut().signals.remove(&signum);
                return Err(err);
            }
        }
        Ok(())
    }

    fn unwatch_signal(&self, signum: i32) {
        let last = {
            let mut st = self.state.borrow_mut();
            match st.signals.get_mut(&signum) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    st.signals.remove(&signum);
                    true
                }
                None => false,
            }
        };
        if last {
            if let Ok(hub) = hub() {
                hub.unregister(signum, self.token);
            }
        }
    }

    pub(crate) fn unregister_signals(&self) {
        let signums: Vec<i32> = self.state.borrow_mut().signals.drain().map(|(s, _)| s).collect();
        if let Ok(hub) = hub() {
            for signum in signums {
                hub.unregister(signum, self.token);
            }
        }
    }

    pub(crate) fn dispatch_signal(&self, signum: i32) {
        let targets: Vec<HandleId> = self
            .state
            .borrow()
            .handles
            .iter()
            .filter(|(_, rec)| match &rec.state {
                HandleState::Signal(state) => rec.is_active() && state.signum == signum,
                _ => false,
            })
            .map(|(id, _)| HandleId(*id))
            .collect();

        for id in targets {
            let found = self
                .with_handle(id, |rec| match &rec.state {
                    HandleState::Signal(state) if rec.is_active() => Some((state.cb, state.oneshot)),
                    _ => None,
                })
                .flatten();
            let Some((cb, oneshot)) = found else {
                continue;
            };
            if oneshot {
                let _ = self.signal_stop(id);
            }
            if let Some(cb) = cb {
                cb(self, id, signum);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignore(_lp: &Loop, _id: HandleId, _signum: i32) {}

    #[test]
    fn test_rejects_out_of_range() {
        let lp = Loop::with_pool_size(1);
        let s = lp.signal_init();
        assert_eq!(lp.signal_start(s, ignore, 0), Err(Errno::EINVAL));
        assert_eq!(lp.signal_start(s, ignore, MAX_SIGNAL + 1), Err(Errno::EINVAL));
        assert!(!lp.is_active(s));
    }

    #[test]
    fn test_stop_inactive_is_noop() {
        let lp = Loop::with_pool_size(1);
        let s = lp.signal_init();
        assert!(lp.signal_stop(s).is_ok());
        assert_eq!(lp.signal_signum(s), Ok(0));
    }

    #[test]
    fn test_handler_never_blocks_and_keeps_errno() {
        hub().unwrap();
        let fd = WRITE_FD.load(Ordering::Acquire);
        // SAFETY: querying flags of the hub's own pipe; errno is thread-local.
        unsafe {
            assert_ne!(libc::fcntl(fd, libc::F_GETFL) & libc::O_NONBLOCK, 0);
            *errno_location() = libc::EDOM;
        }
        // far more bytes than a pipe buffer holds
        for _ in 0..200_000 {
            on_signal(libc::SIGWINCH);
        }
        // SAFETY: as above.
        assert_eq!(unsafe { *errno_location() }, libc::EDOM);
    }
}

//! OS threads and thread-level utilities

use std::ffi::CString;
use std::os::unix::thread::JoinHandleExt;
use std::thread::{self, JoinHandle};

use crate::error::{Errno, UvResult};

/// Thread creation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    /// Stack size in bytes; `None` for the platform default.
    pub stack_size: Option<usize>,
}

/// Identity of a running OS thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRef(libc::pthread_t);

impl ThreadRef {
    /// The calling thread.
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        ThreadRef(unsafe { libc::pthread_self() })
    }

    /// Whether both refer to the same thread.
    pub fn equal(&self, other: &ThreadRef) -> bool {
        // SAFETY: comparing two thread ids.
        unsafe { libc::pthread_equal(self.0, other.0) != 0 }
    }

    /// CPU affinity mask, one entry per CPU.
    #[cfg(target_os = "linux")]
    pub fn getaffinity(&self) -> UvResult<Vec<bool>> {
        // SAFETY: the cpu set is plain data sized as passed.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            let rc = libc::pthread_getaffinity_np(self.0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
            if rc != 0 {
                return Err(Errno::translate_sys_error(rc));
            }
            Ok((0..libc::CPU_SETSIZE as usize).map(|cpu| libc::CPU_ISSET(cpu, &set)).collect())
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn getaffinity(&self) -> UvResult<Vec<bool>> {
        Err(Errno::ENOTSUP)
    }

    /// Replace the affinity mask, returning the previous one.
    #[cfg(target_os = "linux")]
    pub fn setaffinity(&self, mask: &[bool]) -> UvResult<Vec<bool>> {
        let previous = self.getaffinity()?;
        // SAFETY: as in getaffinity.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for (cpu, on) in mask.iter().enumerate().take(libc::CPU_SETSIZE as usize) {
                if *on {
                    libc::CPU_SET(cpu, &mut set);
                }
            }
            let rc = libc::pthread_setaffinity_np(self.0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if rc != 0 {
                return Err(Errno::translate_sys_error(rc));
            }
        }
        Ok(previous)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn setaffinity(&self, _mask: &[bool]) -> UvResult<Vec<bool>> {
        Err(Errno::ENOTSUP)
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

/// A spawned thread.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: ThreadRef,
}

impl Thread {
    /// Spawn `f` on a new OS thread.
    pub fn spawn<F>(options: ThreadOptions, f: F) -> UvResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(size) = options.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(f).map_err(|e| Errno::from_io(&e))?;
        let id = ThreadRef(handle.as_pthread_t());
        Ok(Thread {
            handle: Some(handle),
            id,
        })
    }

    pub fn thread_ref(&self) -> ThreadRef {
        self.id
    }

    /// Wait for the thread to finish. Fails with `EINVAL` if already
    /// joined and `EIO` if the thread panicked.
    pub fn join(&mut self) -> UvResult<()> {
        let handle = self.handle.take().ok_or(Errno::EINVAL)?;
        handle.join().map_err(|_| Errno::EIO)
    }

    /// Let the thread run on without a joiner. Fails with `EINVAL` if it
    /// was already joined or detached.
    pub fn detach(&mut self) -> UvResult<()> {
        self.handle.take().map(drop).ok_or(Errno::EINVAL)
    }

    pub fn is_joined(&self) -> bool {
        self.handle.is_none()
    }
}

/// Number of entries in an affinity mask.
pub fn cpumask_size() -> UvResult<usize> {
    #[cfg(target_os = "linux")]
    {
        Ok(libc::CPU_SETSIZE as usize)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Errno::ENOTSUP)
    }
}

/// CPU the calling thread is running on.
pub fn getcpu() -> UvResult<i32> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            Err(Errno::last_os_error())
        } else {
            Ok(cpu)
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Errno::ENOTSUP)
    }
}

/// Name the calling thread. Long names are truncated to the platform limit.
pub fn setname(name: &str) -> UvResult<()> {
    #[cfg(target_os = "linux")]
    {
        let truncated: Vec<u8> = name.bytes().take(15).collect();
        let cname = CString::new(truncated).map_err(|_| Errno::EINVAL)?;
        // SAFETY: cname outlives the call.
        let rc = unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) };
        if rc != 0 {
            return Err(Errno::translate_sys_error(rc));
        }
        Ok(())
    }
    #[cfg(target_vendor = "apple")]
    {
        let cname = CString::new(name).map_err(|_| Errno::EINVAL)?;
        // SAFETY: cname outlives the call.
        let rc = unsafe { libc::pthread_setname_np(cname.as_ptr()) };
        if rc != 0 {
            return Err(Errno::translate_sys_error(rc));
        }
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
    {
        let _ = CString::new(name);
        Err(Errno::ENOTSUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_and_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let mut t = Thread::spawn(ThreadOptions::default(), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!t.thread_ref().equal(&ThreadRef::current()));
        t.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(t.join(), Err(Errno::EINVAL));
    }

    #[test]
    fn test_self_equal() {
        assert_eq!(ThreadRef::current(), ThreadRef::current());
    }

    #[test]
    fn test_panicking_thread_join_fails() {
        let mut t = Thread::spawn(ThreadOptions { stack_size: Some(256 * 1024) }, || {
            panic!("worker failure");
        })
        .unwrap();
        assert_eq!(t.join(), Err(Errno::EIO));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_affinity_round_trip() {
        let me = ThreadRef::current();
        let mask = me.getaffinity().unwrap();
        assert_eq!(mask.len(), cpumask_size().unwrap());
        assert!(mask.iter().any(|on| *on));
        let previous = me.setaffinity(&mask).unwrap();
        assert_eq!(previous, mask);
        assert!(getcpu().unwrap() >= 0);
    }
}

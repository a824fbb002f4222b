//! Blocking-work thread pool
//!
//! Fixed-size pool fed by a crossbeam channel. Jobs report back to the
//! submitting loop through its wakeup channel, so every submitted job
//! produces exactly one completion: its result, `ECANCELED` if it was
//! cancelled before a worker picked it up, or `EIO` if it panicked.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::Lazy;

use crate::error::{Errno, UvResult};
use crate::event_loop::Wakeup;
use crate::request::ReqId;

/// Pool size when `UV_THREADPOOL_SIZE` is unset or unparsable.
pub const DEFAULT_THREADPOOL_SIZE: usize = 4;

/// Upper bound for the pool size.
pub const MAX_THREADPOOL_SIZE: usize = 1024;

/// Environment variable controlling the pool size.
pub const THREADPOOL_SIZE_ENV: &str = "UV_THREADPOOL_SIZE";

static ENV_POOL_SIZE: Lazy<usize> =
    Lazy::new(|| parse_pool_size(std::env::var(THREADPOOL_SIZE_ENV).ok().as_deref()));

/// Pool size from the environment, read once per process.
pub fn default_pool_size() -> usize {
    *ENV_POOL_SIZE
}

/// Interpret a `UV_THREADPOOL_SIZE` value.
pub fn parse_pool_size(value: Option<&str>) -> usize {
    match value.and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(n) => clamp_pool_size(n),
        None => DEFAULT_THREADPOOL_SIZE,
    }
}

/// Clamp to `1..=MAX_THREADPOOL_SIZE`.
pub fn clamp_pool_size(size: usize) -> usize {
    size.clamp(1, MAX_THREADPOOL_SIZE)
}

pub(crate) const JOB_QUEUED: u8 = 0;
pub(crate) const JOB_RUNNING: u8 = 1;
pub(crate) const JOB_DONE: u8 = 2;
pub(crate) const JOB_CANCELLED: u8 = 3;

pub(crate) type JobFn = Box<dyn FnOnce() -> UvResult<Box<dyn Any + Send>> + Send>;

/// Work sent to a pool thread
pub(crate) struct Job {
    pub(crate) req: ReqId,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) work: JobFn,
    pub(crate) done: Sender<Wakeup>,
}

pub(crate) struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl ThreadPool {
    pub(crate) fn start(size: usize) -> UvResult<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let rx = rx.clone();
            let stopping = stopping.clone();
            let handle = thread::Builder::new()
                .name(format!("uv-worker-{}", i))
                .spawn(move || worker_loop(rx, stopping))
                .map_err(|e| Errno::from_io(&e))?;
            workers.push(handle);
        }

        tracing::debug!(size, "thread pool started");
        Ok(Self {
            tx: Some(tx),
            workers,
            stopping,
        })
    }

    pub(crate) fn submit(&self, job: Job) -> UvResult<()> {
        match &self.tx {
            Some(tx) => tx.send(job).map_err(|_| Errno::EPIPE),
            None => Err(Errno::EPIPE),
        }
    }

    pub(crate) fn shutdown(self) {
        drop(self);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("pool worker panicked outside a job");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>, stopping: Arc<AtomicBool>) {
    for job in rx.iter() {
        let Job {
            req,
            state,
            work,
            done,
        } = job;

        if stopping.load(Ordering::Acquire) {
            let _ = state.compare_exchange(JOB_QUEUED, JOB_CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        }

        let outcome = match state.compare_exchange(JOB_QUEUED, JOB_RUNNING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(?req, "pool job panicked");
                    Err(Errno::EIO)
                }
            },
            Err(_) => Err(Errno::ECANCELED),
        };
        state.store(JOB_DONE, Ordering::Release);
        let _ = done.send(Wakeup::Done { req, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_size() {
        assert_eq!(parse_pool_size(None), DEFAULT_THREADPOOL_SIZE);
        assert_eq!(parse_pool_size(Some("8")), 8);
        assert_eq!(parse_pool_size(Some(" 2 ")), 2);
        assert_eq!(parse_pool_size(Some("0")), 1);
        assert_eq!(parse_pool_size(Some("100000")), MAX_THREADPOOL_SIZE);
        assert_eq!(parse_pool_size(Some("many")), DEFAULT_THREADPOOL_SIZE);
    }

    #[test]
    fn test_jobs_report_back() {
        let pool = ThreadPool::start(2).unwrap();
        let (done_tx, done_rx) = channel::unbounded();
        for i in 0..4u64 {
            pool.submit(Job {
                req: ReqId(i),
                state: Arc::new(AtomicU8::new(JOB_QUEUED)),
                work: Box::new(move || Ok(Box::new(i * 10) as Box<dyn Any + Send>)),
                done: done_tx.clone(),
            })
            .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            match done_rx.recv().unwrap() {
                Wakeup::Done { outcome, .. } => {
                    let value = outcome.unwrap().downcast::<u64>().unwrap();
                    seen.push(*value);
                }
                _ => panic!("unexpected wakeup"),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 10, 20, 30]);
        pool.shutdown();
    }

    #[test]
    fn test_cancelled_job_completes_with_ecanceled() {
        let pool = ThreadPool::start(1).unwrap();
        let (done_tx, done_rx) = channel::unbounded();
        let state = Arc::new(AtomicU8::new(JOB_CANCELLED));
        pool.submit(Job {
            req: ReqId(1),
            state,
            work: Box::new(|| panic!("cancelled job must not run")),
            done: done_tx,
        })
        .unwrap();
        match done_rx.recv().unwrap() {
            Wakeup::Done { outcome, .. } => assert_eq!(outcome.err(), Some(Errno::ECANCELED)),
            _ => panic!("unexpected wakeup"),
        }
    }

    #[test]
    fn test_panicking_job_reports_eio() {
        let pool = ThreadPool::start(1).unwrap();
        let (done_tx, done_rx) = channel::unbounded();
        pool.submit(Job {
            req: ReqId(1),
            state: Arc::new(AtomicU8::new(JOB_QUEUED)),
            work: Box::new(|| panic!("boom")),
            done: done_tx,
        })
        .unwrap();
        match done_rx.recv().unwrap() {
            Wakeup::Done { outcome, .. } => assert_eq!(outcome.err(), Some(Errno::EIO)),
            _ => panic!("unexpected wakeup"),
        }
    }
}

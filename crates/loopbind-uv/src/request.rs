//! Requests: one-shot operations run on the blocking-work pool
//!
//! A request is submitted from the loop thread, executed on a pool thread
//! and completed back on the loop thread during the poll phase. The
//! completion callback runs exactly once, with `ECANCELED` if the request
//! was cancelled before a worker started it.

use std::any::Any;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{Errno, UvResult};
use crate::event_loop::Loop;
use crate::threadpool::{Job, JOB_CANCELLED, JOB_QUEUED};

/// Identity of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub(crate) u64);

impl ReqId {
    /// Raw id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Request type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqType {
    Fs,
    Work,
    GetAddrInfo,
    GetNameInfo,
}

impl ReqType {
    /// Name as reported to scripts (`"fs"`, `"work"`, ...).
    pub fn name(self) -> &'static str {
        match self {
            ReqType::Fs => "fs",
            ReqType::Work => "work",
            ReqType::GetAddrInfo => "getaddrinfo",
            ReqType::GetNameInfo => "getnameinfo",
        }
    }

    /// Numeric tag, matching libuv's `uv_req_type`.
    pub fn code(self) -> i32 {
        match self {
            ReqType::Fs => 6,
            ReqType::Work => 7,
            ReqType::GetAddrInfo => 8,
            ReqType::GetNameInfo => 9,
        }
    }
}

/// What a completion callback receives.
pub struct Done<T> {
    /// The finished request; no longer valid after the callback.
    pub req: ReqId,
    /// Data attached at submission.
    pub data: Option<Rc<dyn Any>>,
    /// Result of the blocking work.
    pub result: UvResult<T>,
}

type Completion = Box<dyn FnOnce(&Loop, Option<Rc<dyn Any>>, UvResult<Box<dyn Any + Send>>)>;

pub(crate) struct RequestRecord {
    kind: ReqType,
    data: Option<Rc<dyn Any>>,
    job: Arc<AtomicU8>,
    complete: Completion,
}

impl Loop {
    /// Run `work` on the pool and call `cb` with its result on the loop
    /// thread. `data` travels with the request and comes back in [`Done`].
    pub fn submit<T, W>(
        &self,
        kind: ReqType,
        data: Option<Rc<dyn Any>>,
        work: W,
        cb: fn(&Loop, Done<T>),
    ) -> UvResult<ReqId>
    where
        T: Send + 'static,
        W: FnOnce() -> UvResult<T> + Send + 'static,
    {
        let req = ReqId(self.state.borrow_mut().next_id());
        let job_state = Arc::new(AtomicU8::new(JOB_QUEUED));

        let complete: Completion = Box::new(move |lp, data, outcome| {
            let result = outcome.and_then(|payload| match payload.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(Errno::EINVAL),
            });
            cb(lp, Done { req, data, result });
        });

        self.state.borrow_mut().requests.insert(
            req.0,
            RequestRecord {
                kind,
                data,
                job: job_state.clone(),
                complete,
            },
        );

        let job = Job {
            req,
            state: job_state,
            work: Box::new(move || work().map(|value| Box::new(value) as Box<dyn Any + Send>)),
            done: self.wake_sender(),
        };
        if let Err(err) = self.submit_job(job) {
            let record = self.state.borrow_mut().requests.remove(&req.0);
            drop(record);
            tracing::warn!(kind = kind.name(), %err, "request submission failed");
            return Err(err);
        }
        tracing::trace!(req = req.0, kind = kind.name(), "request submitted");
        Ok(req)
    }

    pub(crate) fn complete_request(&self, req: ReqId, outcome: UvResult<Box<dyn Any + Send>>) {
        let record = self.state.borrow_mut().requests.remove(&req.0);
        match record {
            Some(record) => (record.complete)(self, record.data, outcome),
            None => tracing::warn!(req = req.0, "completion for unknown request"),
        }
    }

    /// Cancel a request that has not started yet. Its callback still runs,
    /// with `ECANCELED`. Fails with `EBUSY` once a worker has picked it up.
    pub fn cancel(&self, req: ReqId) -> UvResult<()> {
        let st = self.state.borrow();
        let record = st.requests.get(&req.0).ok_or(Errno::EINVAL)?;
        match record
            .job
            .compare_exchange(JOB_QUEUED, JOB_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(Errno::EBUSY),
        }
    }

    /// Type of a pending request.
    pub fn req_type(&self, req: ReqId) -> Option<ReqType> {
        self.state.borrow().requests.get(&req.0).map(|r| r.kind)
    }

    /// Data attached to a pending request.
    pub fn req_data(&self, req: ReqId) -> Option<Rc<dyn Any>> {
        self.state
            .borrow()
            .requests
            .get(&req.0)
            .and_then(|r| r.data.clone())
    }

    /// Number of requests still waiting for completion.
    pub fn pending_requests(&self) -> usize {
        self.state.borrow().requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::RunMode;
    use std::cell::RefCell;
    use std::sync::mpsc;
    use std::time::Duration;

    thread_local! {
        static RESULTS: RefCell<Vec<UvResult<u32>>> = RefCell::new(Vec::new());
    }

    fn collect(_lp: &Loop, done: Done<u32>) {
        RESULTS.with(|r| r.borrow_mut().push(done.result));
    }

    #[test]
    fn test_submit_completes_on_loop_thread() {
        RESULTS.with(|r| r.borrow_mut().clear());
        let lp = Loop::with_pool_size(2);
        let req = lp.submit(ReqType::Work, None, || Ok(41 + 1), collect).unwrap();
        assert_eq!(lp.req_type(req), Some(ReqType::Work));
        assert!(lp.alive());
        lp.run(RunMode::Default);
        RESULTS.with(|r| assert_eq!(*r.borrow(), vec![Ok(42)]));
        assert_eq!(lp.pending_requests(), 0);
        assert_eq!(lp.req_type(req), None);
    }

    #[test]
    fn test_error_result_is_delivered() {
        RESULTS.with(|r| r.borrow_mut().clear());
        let lp = Loop::with_pool_size(1);
        lp.submit(ReqType::Fs, None, || Err::<u32, _>(Errno::ENOENT), collect)
            .unwrap();
        lp.run(RunMode::Default);
        RESULTS.with(|r| assert_eq!(*r.borrow(), vec![Err(Errno::ENOENT)]));
    }

    #[test]
    fn test_cancel_queued_request() {
        RESULTS.with(|r| r.borrow_mut().clear());
        let lp = Loop::with_pool_size(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Occupy the only worker so the second request stays queued.
        let blocker = lp
            .submit(
                ReqType::Work,
                None,
                move || {
                    started_tx.send(()).ok();
                    gate_rx.recv_timeout(Duration::from_secs(5)).ok();
                    Ok(1)
                },
                collect,
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let queued = lp.submit(ReqType::Work, None, || Ok(2), collect).unwrap();

        assert_eq!(lp.cancel(blocker), Err(Errno::EBUSY));
        assert_eq!(lp.cancel(queued), Ok(()));
        gate_tx.send(()).unwrap();

        lp.run(RunMode::Default);
        RESULTS.with(|r| {
            let results = r.borrow();
            assert_eq!(results.len(), 2);
            assert!(results.contains(&Ok(1)));
            assert!(results.contains(&Err(Errno::ECANCELED)));
        });
    }

    #[test]
    fn test_cancel_unknown_request() {
        let lp = Loop::with_pool_size(1);
        assert_eq!(lp.cancel(ReqId(999)), Err(Errno::EINVAL));
    }

    #[test]
    fn test_request_data_comes_back() {
        thread_local! {
            static TAG: RefCell<Option<String>> = RefCell::new(None);
        }
        fn check_tag(_lp: &Loop, done: Done<()>) {
            let tag = done.data.and_then(|d| d.downcast_ref::<String>().cloned());
            TAG.with(|t| *t.borrow_mut() = tag);
        }

        let lp = Loop::with_pool_size(1);
        let req = lp
            .submit(ReqType::Work, Some(Rc::new("tag".to_string())), || Ok(()), check_tag)
            .unwrap();
        assert!(lp.req_data(req).is_some());
        lp.run(RunMode::Default);
        TAG.with(|t| assert_eq!(t.borrow().as_deref(), Some("tag")));
    }
}

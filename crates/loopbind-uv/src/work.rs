//! Generic work requests

use std::any::Any;
use std::rc::Rc;

use crate::error::UvResult;
use crate::event_loop::Loop;
use crate::request::{Done, ReqId, ReqType};

/// Called on the loop thread once the work has run (or was cancelled).
pub type AfterWorkCb = fn(&Loop, Done<()>);

impl Loop {
    /// Queue `work` on the pool; `after` runs on the loop thread.
    pub fn queue_work<W>(&self, data: Option<Rc<dyn Any>>, work: W, after: AfterWorkCb) -> UvResult<ReqId>
    where
        W: FnOnce() + Send + 'static,
    {
        self.submit(
            ReqType::Work,
            data,
            move || {
                work();
                Ok(())
            },
            after,
        )
    }
}

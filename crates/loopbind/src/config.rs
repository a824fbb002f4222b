//! Bridge configuration and process-wide worker runtime hooks

use loopbind_sdk::{AbiResult, AcquireVm, NativeError, ReleaseVm};
use loopbind_uv::Loop;
use once_cell::sync::OnceCell;

/// Options for [`Bridge::new`](crate::Bridge::new).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Blocking-work pool size. `None` reads `UV_THREADPOOL_SIZE` (default 4).
    /// Values are clamped to `1..=1024`.
    pub threadpool_size: Option<usize>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threadpool_size(mut self, size: usize) -> Self {
        self.threadpool_size = Some(size);
        self
    }

    pub(crate) fn make_loop(&self) -> Loop {
        match self.threadpool_size {
            Some(size) => Loop::with_pool_size(size),
            None => Loop::new(),
        }
    }
}

/// Acquire/release pair handing out runtimes to work-pool and thread code.
#[derive(Clone, Copy)]
pub struct ThreadHooks {
    pub acquire: AcquireVm,
    pub release: ReleaseVm,
}

static THREAD_HOOKS: OnceCell<ThreadHooks> = OnceCell::new();

/// Install the worker runtime hooks. They can be set once per process;
/// returns `false` if hooks were already installed.
pub fn set_thread_hooks(acquire: AcquireVm, release: ReleaseVm) -> bool {
    let installed = THREAD_HOOKS.set(ThreadHooks { acquire, release }).is_ok();
    if installed {
        tracing::debug!("worker runtime hooks installed");
    }
    installed
}

/// Currently installed hooks.
pub fn thread_hooks() -> Option<ThreadHooks> {
    THREAD_HOOKS.get().copied()
}

pub(crate) fn require_thread_hooks() -> AbiResult<ThreadHooks> {
    thread_hooks().ok_or_else(|| NativeError::Runtime("no worker runtime hooks installed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        assert_eq!(Config::new().threadpool_size, None);
        assert_eq!(Config::new().with_threadpool_size(2).threadpool_size, Some(2));
    }

    #[test]
    fn test_pool_size_is_clamped() {
        assert_eq!(Config::new().with_threadpool_size(0).make_loop().pool_size(), 1);
        assert_eq!(Config::new().with_threadpool_size(5000).make_loop().pool_size(), 1024);
    }
}

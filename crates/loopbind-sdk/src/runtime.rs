//! Worker-thread scripting runtimes
//!
//! Work requests and threads run script code off the loop thread. Each of
//! those OS threads gets its own runtime instance through an acquire hook and
//! hands it back through the matching release hook.

use crate::error::AbiResult;
use crate::value::ThreadValue;

/// An independent scripting runtime owned by one worker thread.
pub trait ScriptRuntime: Send {
    /// Load `chunk` (produced by [`ScriptContext::dump_function`](crate::ScriptContext::dump_function))
    /// and call it with `args`.
    fn execute(
        &mut self,
        chunk: &[u8],
        chunk_name: &str,
        args: Vec<ThreadValue>,
    ) -> AbiResult<Vec<ThreadValue>>;

    /// Set a global in this runtime (used to mark worker runtimes).
    fn set_global(&mut self, name: &str, value: ThreadValue);
}

/// Create a runtime for the calling thread. `None` means the embedding
/// cannot provide one.
pub type AcquireVm = fn() -> Option<Box<dyn ScriptRuntime>>;

/// Dispose of a runtime obtained from [`AcquireVm`].
pub type ReleaseVm = fn(Box<dyn ScriptRuntime>);

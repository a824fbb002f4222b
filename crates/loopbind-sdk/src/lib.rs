//! loopbind SDK - the embedding ABI
//!
//! This crate holds the types shared by the bridge and by scripting runtimes
//! that embed it: values, strong references, userdata payloads, the main-thread
//! [`ScriptContext`] and the per-worker [`ScriptRuntime`].
//!
//! An embedding implements [`ScriptContext`] for its interpreter state and,
//! if it wants work requests and threads, installs acquire/release hooks that
//! hand out [`ScriptRuntime`] instances.

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod runtime;
pub mod value;

pub use context::{userdata_of, ScriptContext, StrongRef, Userdata};
pub use error::{AbiResult, NativeError};
pub use runtime::{AcquireVm, ReleaseVm, ScriptRuntime};
pub use value::{ObjectRef, ThreadPort, ThreadValue, Value};

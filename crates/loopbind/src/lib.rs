//! loopbind - event-loop bindings for embedded scripting runtimes
//!
//! A [`Bridge`] owns one native loop and exposes it to a scripting runtime
//! through flat bound functions (`new_timer`, `timer_start`, `fs_open`,
//! `run`, ...). Handles become userdata owned jointly by the loop and the
//! runtime's collector; requests pin their callbacks until they complete
//! exactly once. Work requests and threads run script code in separate
//! runtimes handed out by [`set_thread_hooks`].
//!
//! Native failures never raise: bound functions return
//! `nil, "NAME: message", "NAME"`. Bad arguments and use of closed handles
//! raise a [`NativeError`](loopbind_sdk::NativeError).

pub mod args;
pub mod async_handle;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod dns;
pub mod event_loop;
pub mod fs;
pub mod fs_event;
pub mod fs_poll;
pub mod handle;
pub mod module;
pub mod request;
pub mod result;
pub mod signal;
pub mod thread;
pub mod timer;
pub mod watcher;
pub mod work;

pub use args::MAX_THREAD_ARGS;
pub use async_handle::AsyncPort;
pub use bridge::Bridge;
pub use config::{set_thread_hooks, thread_hooks, Config, ThreadHooks};
pub use handle::{HandleWrapper, Lifecycle};
pub use module::{method_table, BoundFn, FunctionRegistry};
pub use request::RequestWrapper;
pub use result::{error_message, fail};
pub use work::WorkerVms;

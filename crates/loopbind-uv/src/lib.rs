//! Single-threaded event loop
//!
//! A small libuv-style loop: timers, idle/prepare/check watchers, async
//! wakeups, signals, change notification and stat polling as handles;
//! filesystem, DNS and generic work as requests completed from a
//! blocking-work pool.
//!
//! Handles and requests are addressed by id. Callbacks are plain function
//! pointers that receive the loop, so per-handle state lives in the
//! handle's user data slot.

pub mod async_handle;
pub mod dns;
pub mod error;
pub mod event_loop;
pub mod fs;
pub mod fs_event;
pub mod fs_poll;
pub mod handle;
pub mod request;
pub mod signal;
pub mod thread;
pub mod threadpool;
pub mod timer;
pub mod watcher;
pub mod work;

pub use async_handle::{AsyncCb, AsyncSender};
pub use dns::{AddrInfo, AddrInfoHints, GetAddrInfoCb, GetNameInfoCb, NameInfo};
pub use error::{Errno, UvResult};
pub use event_loop::{hrtime, Loop, Metrics, RunMode};
pub use fs::{Dirent, DirentType, FsCb, FsOp, FsValue, Stat, Timespec};
pub use fs_event::FsEventCb;
pub use fs_poll::FsPollCb;
pub use handle::{CloseCb, HandleId, HandleType};
pub use request::{Done, ReqId, ReqType};
pub use signal::SignalCb;
pub use thread::{Thread, ThreadOptions, ThreadRef};
pub use timer::TimerCb;
pub use watcher::WatcherCb;
pub use work::AfterWorkCb;

//! Symbolic function registry
//!
//! Registers every bound function under its flat name (`"new_timer"`,
//! `"timer_start"`, `"fs_open"`, ...) and describes the per-type method
//! tables embeddings attach to userdata (`timer:start(...)` is
//! `timer_start(timer, ...)`).

use std::collections::HashMap;
use std::rc::Rc;

use loopbind_sdk::{AbiResult, Value};

use crate::bridge::Bridge;

/// A bound function.
pub type BoundFn = Rc<dyn Fn(&Bridge, &[Value]) -> AbiResult<Vec<Value>>>;

/// Bound functions by name.
pub struct FunctionRegistry {
    functions: HashMap<String, BoundFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function by name, replacing any previous one.
    pub fn register(&mut self, name: &str, function: impl Fn(&Bridge, &[Value]) -> AbiResult<Vec<Value>> + 'static) {
        self.functions.insert(name.to_string(), Rc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<BoundFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every bound function.
pub fn register_all(registry: &mut FunctionRegistry) {
    register_handle(registry);
    register_timer(registry);
    register_watchers(registry);
    register_async(registry);
    register_signal(registry);
    register_fs_poll(registry);
    register_fs_event(registry);
    register_fs(registry);
    register_dns(registry);
    register_work(registry);
    register_thread(registry);
    register_loop(registry);
}

fn register_handle(registry: &mut FunctionRegistry) {
    registry.register("close", |b, args| crate::handle::close(b, args));
    registry.register("is_active", |b, args| crate::handle::is_active(b, args));
    registry.register("is_closing", |b, args| crate::handle::is_closing(b, args));
    registry.register("ref", |b, args| crate::handle::ref_handle(b, args));
    registry.register("unref", |b, args| crate::handle::unref_handle(b, args));
    registry.register("has_ref", |b, args| crate::handle::has_ref(b, args));
    registry.register("handle_get_type", |b, args| crate::handle::get_type(b, args));
}

fn register_timer(registry: &mut FunctionRegistry) {
    registry.register("new_timer", |b, args| crate::timer::new_timer(b, args));
    registry.register("timer_start", |b, args| crate::timer::start(b, args));
    registry.register("timer_stop", |b, args| crate::timer::stop(b, args));
    registry.register("timer_again", |b, args| crate::timer::again(b, args));
    registry.register("timer_set_repeat", |b, args| crate::timer::set_repeat(b, args));
    registry.register("timer_get_repeat", |b, args| crate::timer::get_repeat(b, args));
    registry.register("timer_get_due_in", |b, args| crate::timer::get_due_in(b, args));
}

fn register_watchers(registry: &mut FunctionRegistry) {
    registry.register("new_idle", |b, args| crate::watcher::new_idle(b, args));
    registry.register("idle_start", |b, args| crate::watcher::idle_start(b, args));
    registry.register("idle_stop", |b, args| crate::watcher::idle_stop(b, args));
    registry.register("new_prepare", |b, args| crate::watcher::new_prepare(b, args));
    registry.register("prepare_start", |b, args| crate::watcher::prepare_start(b, args));
    registry.register("prepare_stop", |b, args| crate::watcher::prepare_stop(b, args));
    registry.register("new_check", |b, args| crate::watcher::new_check(b, args));
    registry.register("check_start", |b, args| crate::watcher::check_start(b, args));
    registry.register("check_stop", |b, args| crate::watcher::check_stop(b, args));
}

fn register_async(registry: &mut FunctionRegistry) {
    registry.register("new_async", |b, args| crate::async_handle::new_async(b, args));
    registry.register("async_send", |b, args| crate::async_handle::send(b, args));
}

fn register_signal(registry: &mut FunctionRegistry) {
    registry.register("new_signal", |b, args| crate::signal::new_signal(b, args));
    registry.register("signal_start", |b, args| crate::signal::start(b, args));
    registry.register("signal_start_oneshot", |b, args| crate::signal::start_oneshot(b, args));
    registry.register("signal_stop", |b, args| crate::signal::stop(b, args));
}

fn register_fs_event(registry: &mut FunctionRegistry) {
    registry.register("new_fs_event", |b, args| crate::fs_event::new_fs_event(b, args));
    registry.register("fs_event_start", |b, args| crate::fs_event::start(b, args));
    registry.register("fs_event_stop", |b, args| crate::fs_event::stop(b, args));
    registry.register("fs_event_getpath", |b, args| crate::fs_event::getpath(b, args));
}

fn register_fs_poll(registry: &mut FunctionRegistry) {
    registry.register("new_fs_poll", |b, args| crate::fs_poll::new_fs_poll(b, args));
    registry.register("fs_poll_start", |b, args| crate::fs_poll::start(b, args));
    registry.register("fs_poll_stop", |b, args| crate::fs_poll::stop(b, args));
    registry.register("fs_poll_getpath", |b, args| crate::fs_poll::getpath(b, args));
}

fn register_fs(registry: &mut FunctionRegistry) {
    registry.register("fs_open", |b, args| crate::fs::open(b, args));
    registry.register("fs_close", |b, args| crate::fs::close(b, args));
    registry.register("fs_read", |b, args| crate::fs::read(b, args));
    registry.register("fs_write", |b, args| crate::fs::write(b, args));
    registry.register("fs_unlink", |b, args| crate::fs::unlink(b, args));
    registry.register("fs_mkdir", |b, args| crate::fs::mkdir(b, args));
    registry.register("fs_mkdtemp", |b, args| crate::fs::mkdtemp(b, args));
    registry.register("fs_mkstemp", |b, args| crate::fs::mkstemp(b, args));
    registry.register("fs_rmdir", |b, args| crate::fs::rmdir(b, args));
    registry.register("fs_scandir", |b, args| crate::fs::scandir(b, args));
    registry.register("fs_scandir_next", |b, args| crate::fs::scandir_next(b, args));
    registry.register("fs_stat", |b, args| crate::fs::stat(b, args));
    registry.register("fs_fstat", |b, args| crate::fs::fstat(b, args));
    registry.register("fs_lstat", |b, args| crate::fs::lstat(b, args));
    registry.register("fs_rename", |b, args| crate::fs::rename(b, args));
    registry.register("fs_fsync", |b, args| crate::fs::fsync(b, args));
    registry.register("fs_fdatasync", |b, args| crate::fs::fdatasync(b, args));
    registry.register("fs_ftruncate", |b, args| crate::fs::ftruncate(b, args));
    registry.register("fs_sendfile", |b, args| crate::fs::sendfile(b, args));
    registry.register("fs_access", |b, args| crate::fs::access(b, args));
    registry.register("fs_chmod", |b, args| crate::fs::chmod(b, args));
    registry.register("fs_fchmod", |b, args| crate::fs::fchmod(b, args));
    registry.register("fs_utime", |b, args| crate::fs::utime(b, args));
    registry.register("fs_futime", |b, args| crate::fs::futime(b, args));
    registry.register("fs_lutime", |b, args| crate::fs::lutime(b, args));
    registry.register("fs_link", |b, args| crate::fs::link(b, args));
    registry.register("fs_symlink", |b, args| crate::fs::symlink(b, args));
    registry.register("fs_readlink", |b, args| crate::fs::readlink(b, args));
    registry.register("fs_realpath", |b, args| crate::fs::realpath(b, args));
    registry.register("fs_chown", |b, args| crate::fs::chown(b, args));
    registry.register("fs_fchown", |b, args| crate::fs::fchown(b, args));
    registry.register("fs_lchown", |b, args| crate::fs::lchown(b, args));
    registry.register("fs_copyfile", |b, args| crate::fs::copyfile(b, args));
}

fn register_dns(registry: &mut FunctionRegistry) {
    registry.register("getaddrinfo", |b, args| crate::dns::getaddrinfo(b, args));
    registry.register("getnameinfo", |b, args| crate::dns::getnameinfo(b, args));
}

fn register_work(registry: &mut FunctionRegistry) {
    registry.register("new_work", |b, args| crate::work::new_work(b, args));
    registry.register("queue_work", |b, args| crate::work::queue_work(b, args));
}

fn register_thread(registry: &mut FunctionRegistry) {
    registry.register("new_thread", |b, args| crate::thread::new_thread(b, args));
    registry.register("thread_join", |b, args| crate::thread::join(b, args));
    registry.register("thread_detach", |b, args| crate::thread::detach(b, args));
    registry.register("thread_self", |b, args| crate::thread::thread_self(b, args));
    registry.register("thread_equal", |b, args| crate::thread::equal(b, args));
    registry.register("thread_setname", |b, args| crate::thread::setname(b, args));
    registry.register("thread_getcpu", |b, args| crate::thread::getcpu(b, args));
    registry.register("thread_getaffinity", |b, args| crate::thread::getaffinity(b, args));
    registry.register("thread_setaffinity", |b, args| crate::thread::setaffinity(b, args));
    registry.register("cpumask_size", |b, args| crate::thread::cpumask_size(b, args));
}

fn register_loop(registry: &mut FunctionRegistry) {
    registry.register("run", |b, args| crate::event_loop::run(b, args));
    registry.register("stop", |b, args| crate::event_loop::stop(b, args));
    registry.register("loop_alive", |b, args| crate::event_loop::alive(b, args));
    registry.register("loop_mode", |b, args| crate::event_loop::mode(b, args));
    registry.register("loop_close", |b, args| crate::event_loop::close(b, args));
    registry.register("now", |b, args| crate::event_loop::now(b, args));
    registry.register("hrtime", |b, args| crate::event_loop::hrtime(b, args));
    registry.register("update_time", |b, args| crate::event_loop::update_time(b, args));
    registry.register("backend_timeout", |b, args| crate::event_loop::backend_timeout(b, args));
    registry.register("walk", |b, args| crate::event_loop::walk(b, args));
    registry.register("cancel", |b, args| crate::request::cancel(b, args));
    registry.register("req_get_type", |b, args| crate::request::get_type(b, args));
    registry.register("metrics_idle_time", |b, args| crate::event_loop::metrics_idle_time(b, args));
    registry.register("metrics_info", |b, args| crate::event_loop::metrics_info(b, args));
    registry.register("err_name", |b, args| crate::event_loop::err_name(b, args));
    registry.register("strerror", |b, args| crate::event_loop::strerror(b, args));
    registry.register("translate_sys_error", |b, args| crate::event_loop::translate_sys_error(b, args));
    registry.register("available_parallelism", |b, args| crate::event_loop::available_parallelism(b, args));
    registry.register("constants", |b, args| crate::constants::constants(b, args));
}

// ============================================================================
// Method tables
// ============================================================================

const HANDLE_METHODS: &[(&str, &str)] = &[
    ("close", "close"),
    ("is_active", "is_active"),
    ("is_closing", "is_closing"),
    ("ref", "ref"),
    ("unref", "unref"),
    ("has_ref", "has_ref"),
    ("get_type", "handle_get_type"),
];

const REQ_METHODS: &[(&str, &str)] = &[("cancel", "cancel"), ("get_type", "req_get_type")];

/// Methods for a userdata type, as `(method, function)` pairs.
pub fn method_table(type_name: &str) -> Option<Vec<(&'static str, &'static str)>> {
    let specific: &[(&str, &str)] = match type_name {
        "uv_timer" => &[
            ("start", "timer_start"),
            ("stop", "timer_stop"),
            ("again", "timer_again"),
            ("set_repeat", "timer_set_repeat"),
            ("get_repeat", "timer_get_repeat"),
            ("get_due_in", "timer_get_due_in"),
        ],
        "uv_idle" => &[("start", "idle_start"), ("stop", "idle_stop")],
        "uv_prepare" => &[("start", "prepare_start"), ("stop", "prepare_stop")],
        "uv_check" => &[("start", "check_start"), ("stop", "check_stop")],
        "uv_async" => &[("send", "async_send")],
        "uv_signal" => &[
            ("start", "signal_start"),
            ("start_oneshot", "signal_start_oneshot"),
            ("stop", "signal_stop"),
        ],
        "uv_fs_event" => &[
            ("start", "fs_event_start"),
            ("stop", "fs_event_stop"),
            ("getpath", "fs_event_getpath"),
        ],
        "uv_fs_poll" => &[
            ("start", "fs_poll_start"),
            ("stop", "fs_poll_stop"),
            ("getpath", "fs_poll_getpath"),
        ],
        "uv_req" | "uv_fs" => return Some(REQ_METHODS.to_vec()),
        "uv_fs_scandir" => return Some(vec![("next", "fs_scandir_next")]),
        "luv_work_ctx" => return Some(vec![("queue", "queue_work")]),
        "uv_thread" => {
            return Some(vec![
                ("join", "thread_join"),
                ("detach", "thread_detach"),
                ("equal", "thread_equal"),
                ("getaffinity", "thread_getaffinity"),
                ("setaffinity", "thread_setaffinity"),
                ("getcpu", "thread_getcpu"),
                ("setname", "thread_setname"),
            ])
        }
        _ => return None,
    };
    Some(HANDLE_METHODS.iter().chain(specific).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.is_empty());
        register_all(&mut registry);
        for name in ["new_timer", "fs_open", "getaddrinfo", "queue_work", "new_thread", "run", "constants"] {
            assert!(registry.contains(name), "{} missing", name);
        }
        let names = registry.names();
        assert_eq!(names.len(), registry.len());
        assert!(names.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_method_tables_point_at_registered_functions() {
        let mut registry = FunctionRegistry::new();
        register_all(&mut registry);
        for ty in [
            "uv_timer",
            "uv_idle",
            "uv_prepare",
            "uv_check",
            "uv_async",
            "uv_signal",
            "uv_fs_event",
            "uv_fs_poll",
            "uv_req",
            "uv_fs",
            "uv_fs_scandir",
            "luv_work_ctx",
            "uv_thread",
        ] {
            let methods = method_table(ty).unwrap();
            for (method, function) in methods {
                assert!(registry.contains(function), "{}:{} -> {}", ty, method, function);
            }
        }
        assert!(method_table("uv_tcp").is_none());
        let timer = method_table("uv_timer").unwrap();
        assert!(timer.contains(&("get_type", "handle_get_type")));
        assert!(timer.contains(&("start", "timer_start")));
    }
}

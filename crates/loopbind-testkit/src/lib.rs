//! loopbind testkit - an in-memory scripting runtime for tests
//!
//! [`MockRuntime`] implements [`ScriptContext`] with a tiny object heap:
//! closures registered through [`MockRuntime::function`] are callable
//! objects, userdata payloads live until [`MockRuntime::collect`] finds
//! them unpinned (or [`MockRuntime::close`] shuts the runtime down), and
//! every strong reference is counted so tests can assert that nothing
//! leaks.
//!
//! Worker threads get [`MockVm`]s from [`acquire_vm`]/[`release_vm`]. A
//! function dumped from the main runtime becomes the chunk `fn:<name>`;
//! the worker runs the function registered under that name with
//! [`register_worker_fn`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use loopbind_sdk::{
    AbiResult, NativeError, ObjectRef, ScriptContext, ScriptRuntime, StrongRef, ThreadValue, Userdata, Value,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

// ============================================================================
// Main-thread runtime
// ============================================================================

type Body = Rc<dyn Fn(&MockRuntime, Vec<Value>) -> AbiResult<Vec<Value>>>;

enum Object {
    Function { body: Body, name: Option<String> },
    Userdata(Rc<dyn Userdata>),
}

#[derive(Default)]
struct Heap {
    next_object: u64,
    objects: FxHashMap<u64, Object>,
    next_slot: u64,
    refs: FxHashMap<u64, Value>,
}

/// Scripting runtime double.
pub struct MockRuntime {
    heap: RefCell<Heap>,
    errors: RefCell<Vec<String>>,
    closed: Cell<bool>,
}

impl MockRuntime {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            heap: RefCell::new(Heap::default()),
            errors: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        })
    }

    fn alloc(&self, object: Object) -> Value {
        let mut heap = self.heap.borrow_mut();
        heap.next_object += 1;
        let id = heap.next_object;
        heap.objects.insert(id, object);
        Value::Object(ObjectRef(id))
    }

    /// A callable object running `body`. It cannot be dumped for workers.
    pub fn function(&self, body: impl Fn(&MockRuntime, Vec<Value>) -> AbiResult<Vec<Value>> + 'static) -> Value {
        self.alloc(Object::Function {
            body: Rc::new(body),
            name: None,
        })
    }

    /// A callable object that dumps to the worker chunk `fn:<name>`.
    /// Called on the main thread it returns its arguments.
    pub fn named_function(&self, name: &str) -> Value {
        self.alloc(Object::Function {
            body: Rc::new(|_: &MockRuntime, args: Vec<Value>| -> AbiResult<Vec<Value>> { Ok(args) }),
            name: Some(name.to_string()),
        })
    }

    /// Scripting type name of `value`, as [`ScriptContext::type_name`]
    /// reports it.
    pub fn type_name(&self, value: &Value) -> String {
        ScriptContext::type_name(self, value)
    }

    /// Strong references not yet released.
    pub fn live_refs(&self) -> usize {
        self.heap.borrow().refs.len()
    }

    /// Heap objects still alive.
    pub fn object_count(&self) -> usize {
        self.heap.borrow().objects.len()
    }

    /// Messages passed to `report_error`.
    pub fn reported_errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Free every object no strong reference pins, finalizing userdata.
    /// Values the test still holds count as unreachable. Returns how many
    /// objects were freed.
    pub fn collect(&self) -> usize {
        let garbage: Vec<Object> = {
            let mut heap = self.heap.borrow_mut();
            let pinned: Vec<u64> = heap
                .refs
                .values()
                .filter_map(|v| v.as_object().map(|o| o.0))
                .collect();
            let dead: Vec<u64> = heap
                .objects
                .keys()
                .copied()
                .filter(|id| !pinned.contains(id))
                .collect();
            dead.iter().filter_map(|id| heap.objects.remove(id)).collect()
        };
        let freed = garbage.len();
        self.finalize_all(garbage);
        freed
    }

    /// Shut the runtime down: every userdata is finalized, pinned or not.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let everything: Vec<Object> = {
            let mut heap = self.heap.borrow_mut();
            heap.objects.drain().map(|(_, o)| o).collect()
        };
        self.finalize_all(everything);
    }

    fn finalize_all(&self, objects: Vec<Object>) {
        for object in objects {
            if let Object::Userdata(data) = object {
                data.finalize(self);
            }
        }
    }

    fn lookup<T>(&self, value: &Value, f: impl FnOnce(&Object) -> Option<T>) -> Option<T> {
        let id = value.as_object()?.0;
        let heap = self.heap.borrow();
        heap.objects.get(&id).and_then(f)
    }
}

impl ScriptContext for MockRuntime {
    fn type_name(&self, value: &Value) -> String {
        let object_type = self.lookup(value, |object| {
            Some(match object {
                Object::Function { .. } => "function".to_string(),
                Object::Userdata(data) => data.type_name().to_string(),
            })
        });
        match (value, object_type) {
            (Value::Object(_), Some(name)) => name,
            (Value::Object(_), None) => "userdata".to_string(),
            (Value::Integer(_) | Value::Number(_), _) => "number".to_string(),
            (Value::List(_) | Value::Table(_), _) => "table".to_string(),
            (other, _) => other.type_name().to_string(),
        }
    }

    fn is_callable(&self, value: &Value) -> bool {
        self.lookup(value, |object| Some(matches!(object, Object::Function { .. })))
            .unwrap_or(false)
    }

    fn reference(&self, value: &Value) -> StrongRef {
        let mut heap = self.heap.borrow_mut();
        heap.next_slot += 1;
        let slot = heap.next_slot;
        heap.refs.insert(slot, value.clone());
        StrongRef::new(slot)
    }

    fn resolve(&self, strong: &StrongRef) -> Value {
        self.heap
            .borrow()
            .refs
            .get(&strong.slot())
            .cloned()
            .unwrap_or(Value::Nil)
    }

    fn release(&self, strong: StrongRef) {
        let removed = self.heap.borrow_mut().refs.remove(&strong.slot());
        assert!(removed.is_some(), "strong reference {} released twice", strong.slot());
    }

    fn call(&self, callable: &Value, args: Vec<Value>) -> AbiResult<Vec<Value>> {
        let body = self.lookup(callable, |object| match object {
            Object::Function { body, .. } => Some(body.clone()),
            Object::Userdata(_) => None,
        });
        match body {
            Some(body) => body(self, args),
            None => Err(NativeError::TypeMismatch {
                expected: "callable".to_string(),
                got: self.type_name(callable),
            }),
        }
    }

    fn report_error(&self, message: &str) {
        self.errors.borrow_mut().push(message.to_string());
    }

    fn new_userdata(&self, data: Rc<dyn Userdata>) -> AbiResult<Value> {
        if self.closed.get() {
            return Err(NativeError::Lifecycle("runtime is closed".to_string()));
        }
        Ok(self.alloc(Object::Userdata(data)))
    }

    fn userdata(&self, value: &Value) -> Option<Rc<dyn Userdata>> {
        self.lookup(value, |object| match object {
            Object::Userdata(data) => Some(data.clone()),
            Object::Function { .. } => None,
        })
    }

    fn dump_function(&self, value: &Value) -> AbiResult<Vec<u8>> {
        let name = self.lookup(value, |object| match object {
            Object::Function { name, .. } => Some(name.clone()),
            Object::Userdata(_) => None,
        });
        match name {
            Some(Some(name)) => Ok(format!("fn:{}", name).into_bytes()),
            Some(None) => Err(NativeError::AbiError("unable to dump given function".to_string())),
            None => Err(NativeError::TypeMismatch {
                expected: "function".to_string(),
                got: self.type_name(value),
            }),
        }
    }
}

// ============================================================================
// Worker runtimes
// ============================================================================

/// Function a [`MockVm`] can run.
pub type WorkerFn = Arc<dyn Fn(&mut MockVm, Vec<ThreadValue>) -> AbiResult<Vec<ThreadValue>> + Send + Sync>;

fn worker_fn(
    f: impl Fn(&mut MockVm, Vec<ThreadValue>) -> AbiResult<Vec<ThreadValue>> + Send + Sync + 'static,
) -> WorkerFn {
    Arc::new(f)
}

static WORKER_FNS: Lazy<Mutex<FxHashMap<String, WorkerFn>>> = Lazy::new(|| {
    let mut fns: FxHashMap<String, WorkerFn> = FxHashMap::default();
    fns.insert("echo".to_string(), worker_fn(|_, args| Ok(args)));
    fns.insert(
        "fail".to_string(),
        worker_fn(|_, _| Err(NativeError::Runtime("worker failure".to_string()))),
    );
    fns.insert(
        "vm_id".to_string(),
        worker_fn(|vm, _| Ok(vec![ThreadValue::Integer(vm.id() as i64)])),
    );
    fns.insert(
        "is_thread".to_string(),
        worker_fn(|vm, _| Ok(vec![vm.global("_THREAD").unwrap_or(ThreadValue::Nil)])),
    );
    // send(port, ...) signals the port with the remaining arguments
    fns.insert(
        "send".to_string(),
        worker_fn(|_, mut args| {
            if args.is_empty() {
                return Err(NativeError::Runtime("send needs a port".to_string()));
            }
            match args.remove(0) {
                ThreadValue::Port(port) => port.send(args).map(|_| Vec::new()),
                other => Err(NativeError::Runtime(format!("expected a port, got {}", other.type_name()))),
            }
        }),
    );
    Mutex::new(fns)
});

/// Make `name` runnable in worker runtimes, replacing any earlier entry.
pub fn register_worker_fn(
    name: &str,
    f: impl Fn(&mut MockVm, Vec<ThreadValue>) -> AbiResult<Vec<ThreadValue>> + Send + Sync + 'static,
) {
    WORKER_FNS.lock().insert(name.to_string(), worker_fn(f));
}

static NEXT_VM: AtomicU64 = AtomicU64::new(1);
static ACQUIRED: AtomicUsize = AtomicUsize::new(0);
static RELEASED: AtomicUsize = AtomicUsize::new(0);

/// Worker runtime double.
pub struct MockVm {
    id: u64,
    globals: FxHashMap<String, ThreadValue>,
}

impl MockVm {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn global(&self, name: &str) -> Option<ThreadValue> {
        self.globals.get(name).cloned()
    }
}

impl ScriptRuntime for MockVm {
    fn execute(&mut self, chunk: &[u8], _chunk_name: &str, args: Vec<ThreadValue>) -> AbiResult<Vec<ThreadValue>> {
        let name = std::str::from_utf8(chunk)
            .ok()
            .and_then(|text| text.strip_prefix("fn:"))
            .ok_or_else(|| NativeError::Runtime("cannot load chunk".to_string()))?;
        let f = WORKER_FNS
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| NativeError::Runtime(format!("unknown worker function '{}'", name)))?;
        f(self, args)
    }

    fn set_global(&mut self, name: &str, value: ThreadValue) {
        self.globals.insert(name.to_string(), value);
    }
}

/// Acquire hook: a fresh [`MockVm`] with a process-unique id.
pub fn acquire_vm() -> Option<Box<dyn ScriptRuntime>> {
    ACQUIRED.fetch_add(1, Ordering::SeqCst);
    Some(Box::new(MockVm {
        id: NEXT_VM.fetch_add(1, Ordering::SeqCst),
        globals: FxHashMap::default(),
    }))
}

/// Release hook matching [`acquire_vm`].
pub fn release_vm(vm: Box<dyn ScriptRuntime>) {
    RELEASED.fetch_add(1, Ordering::SeqCst);
    drop(vm);
}

/// Runtimes handed out by [`acquire_vm`] so far, process-wide.
pub fn acquired() -> usize {
    ACQUIRED.load(Ordering::SeqCst)
}

/// Runtimes handed back through [`release_vm`] so far, process-wide.
pub fn released() -> usize {
    RELEASED.load(Ordering::SeqCst)
}

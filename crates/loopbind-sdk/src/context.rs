//! ScriptContext trait — the bridge's view of the embedding runtime
//!
//! Everything here runs on the loop thread. Worker threads never see a
//! `ScriptContext`; they get their own [`ScriptRuntime`](crate::ScriptRuntime).

use std::any::Any;
use std::rc::Rc;

use crate::error::AbiResult;
use crate::value::Value;

/// Strong reference held in the embedding's registry.
///
/// While a `StrongRef` is outstanding, the referenced value is reachable for
/// the embedding's collector. The token is deliberately not `Clone`: it is
/// handed back exactly once through [`ScriptContext::release`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StrongRef(u64);

impl StrongRef {
    /// Wrap a registry slot number. Only embeddings create these.
    pub fn new(slot: u64) -> Self {
        StrongRef(slot)
    }

    /// Registry slot number.
    pub fn slot(&self) -> u64 {
        self.0
    }
}

/// Native payload attached to a scripting-level userdata object.
pub trait Userdata: 'static {
    /// Name reported by the runtime's type queries (`"uv_timer"`, `"uv_fs"`, ...).
    fn type_name(&self) -> &'static str;

    /// Downcast support.
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;

    /// Called once by the collector when the object becomes unreachable or
    /// the runtime shuts down. May release strong references; must not call
    /// back into script code.
    fn finalize(&self, _ctx: &dyn ScriptContext) {}
}

/// Operations the bridge needs from the embedding runtime.
pub trait ScriptContext {
    /// Full type name of a value, including userdata and function objects.
    fn type_name(&self, value: &Value) -> String;

    /// Whether the value can be invoked: a function, or an object whose
    /// type implements the invocation protocol.
    fn is_callable(&self, value: &Value) -> bool;

    /// Pin a value in the registry.
    fn reference(&self, value: &Value) -> StrongRef;

    /// Fetch a pinned value.
    fn resolve(&self, strong: &StrongRef) -> Value;

    /// Unpin a value.
    fn release(&self, strong: StrongRef);

    /// Protected call. A script error comes back as `Err`, never as an unwind.
    fn call(&self, callable: &Value, args: Vec<Value>) -> AbiResult<Vec<Value>>;

    /// Top-level error channel for failures no script caller can observe.
    fn report_error(&self, message: &str);

    /// Create a userdata object carrying a native payload.
    fn new_userdata(&self, data: Rc<dyn Userdata>) -> AbiResult<Value>;

    /// Native payload of a userdata object.
    fn userdata(&self, value: &Value) -> Option<Rc<dyn Userdata>>;

    /// Serialize a function so another runtime instance can load it.
    fn dump_function(&self, value: &Value) -> AbiResult<Vec<u8>>;
}

/// Payload of `value` downcast to `T`.
pub fn userdata_of<T: Userdata>(ctx: &dyn ScriptContext, value: &Value) -> Option<Rc<T>> {
    let data = ctx.userdata(value)?;
    data.into_any().downcast::<T>().ok()
}

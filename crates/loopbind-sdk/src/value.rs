//! Values exchanged between the bridge and the scripting runtime

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::AbiResult;

// ============================================================================
// Value
// ============================================================================

/// Opaque identity of a heap object owned by the scripting runtime.
///
/// An `ObjectRef` is only meaningful for the duration of the call that
/// produced it. Anything that must outlive the call is pinned with a
/// [`StrongRef`](crate::StrongRef).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

/// A scripting-level value as seen by native code.
///
/// Plain data (tables of fields, lists) crosses the boundary by value. Heap
/// objects whose identity matters (functions, userdata, callable tables)
/// cross as [`Value::Object`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    Nil,
    /// Boolean
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Floating point number
    Number(f64),
    /// Byte string (not necessarily UTF-8)
    String(Vec<u8>),
    /// Sequence, 1-based on the scripting side
    List(Vec<Value>),
    /// Record with string keys
    Table(Vec<(String, Value)>),
    /// Heap object owned by the runtime
    Object(ObjectRef),
}

impl Value {
    /// Build a string value.
    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Value::String(s.into())
    }

    /// Scripting type name for non-object values; objects report `"userdata"`
    /// here and the context refines it through
    /// [`ScriptContext::type_name`](crate::ScriptContext::type_name).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) | Value::Table(_) => "table",
            Value::Object(_) => "userdata",
        }
    }

    /// Whether this is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Scripting truthiness: everything but nil and false.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Integer view; floats with an exact integer representation convert.
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(n as i64),
            _ => None,
        }
    }

    /// Numeric view.
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Raw bytes of a string value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(b) => Some(b),
            _ => None,
        }
    }

    /// String value as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Object identity, if this is a heap object.
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(o) => Some(*o),
            _ => None,
        }
    }

    /// Field lookup on a table value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Table(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Copy a primitive into its thread-agnostic form. Objects and tables
    /// have no portable representation and yield `None`.
    pub fn to_thread_value(&self) -> Option<ThreadValue> {
        match self {
            Value::Nil => Some(ThreadValue::Nil),
            Value::Boolean(b) => Some(ThreadValue::Boolean(*b)),
            Value::Integer(i) => Some(ThreadValue::Integer(*i)),
            Value::Number(n) => Some(ThreadValue::Number(*n)),
            Value::String(s) => Some(ThreadValue::String(s.clone())),
            Value::List(_) | Value::Table(_) | Value::Object(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into_bytes())
    }
}

// ============================================================================
// Thread-agnostic values
// ============================================================================

/// Object that may be shared with worker threads and signalled from them.
///
/// The async handle's sender is the canonical implementation: a worker
/// receives it as an argument and wakes the owning loop through it.
pub trait ThreadPort: Send + Sync {
    /// Scripting type name of the object this port stands for.
    fn type_name(&self) -> &str;

    /// Deliver values to the owning loop.
    fn send(&self, args: Vec<ThreadValue>) -> AbiResult<()>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// Value deep-copied out of one runtime so it can move to another thread.
#[derive(Clone)]
pub enum ThreadValue {
    /// Absent value
    Nil,
    /// Boolean
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Floating point number
    Number(f64),
    /// Owned byte string
    String(Vec<u8>),
    /// Shareable object
    Port(Arc<dyn ThreadPort>),
}

impl ThreadValue {
    /// Scripting type name.
    pub fn type_name(&self) -> &str {
        match self {
            ThreadValue::Nil => "nil",
            ThreadValue::Boolean(_) => "boolean",
            ThreadValue::Integer(_) | ThreadValue::Number(_) => "number",
            ThreadValue::String(_) => "string",
            ThreadValue::Port(p) => p.type_name(),
        }
    }

    /// Convert a primitive back into a [`Value`]. Ports need the owning
    /// bridge to recover their object and yield `None` here.
    pub fn into_value(self) -> Option<Value> {
        match self {
            ThreadValue::Nil => Some(Value::Nil),
            ThreadValue::Boolean(b) => Some(Value::Boolean(b)),
            ThreadValue::Integer(i) => Some(Value::Integer(i)),
            ThreadValue::Number(n) => Some(Value::Number(n)),
            ThreadValue::String(s) => Some(Value::String(s)),
            ThreadValue::Port(_) => None,
        }
    }
}

impl fmt::Debug for ThreadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadValue::Nil => write!(f, "Nil"),
            ThreadValue::Boolean(b) => write!(f, "Boolean({})", b),
            ThreadValue::Integer(i) => write!(f, "Integer({})", i),
            ThreadValue::Number(n) => write!(f, "Number({})", n),
            ThreadValue::String(s) => write!(f, "String({:?})", String::from_utf8_lossy(s)),
            ThreadValue::Port(p) => write!(f, "Port({})", p.type_name()),
        }
    }
}

impl PartialEq for ThreadValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ThreadValue::Nil, ThreadValue::Nil) => true,
            (ThreadValue::Boolean(a), ThreadValue::Boolean(b)) => a == b,
            (ThreadValue::Integer(a), ThreadValue::Integer(b)) => a == b,
            (ThreadValue::Number(a), ThreadValue::Number(b)) => a == b,
            (ThreadValue::String(a), ThreadValue::String(b)) => a == b,
            (ThreadValue::Port(a), ThreadValue::Port(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_integer_accepts_integral_floats() {
        assert_eq!(Value::Number(3.0).as_integer(), Some(3));
        assert_eq!(Value::Number(3.5).as_integer(), None);
        assert_eq!(Value::Integer(-7).as_integer(), Some(-7));
        assert_eq!(Value::from("7").as_integer(), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(Value::Integer(0).truthy());
        assert!(Value::from("").truthy());
    }

    #[test]
    fn test_table_get() {
        let t = Value::Table(vec![("family".into(), Value::from("inet"))]);
        assert_eq!(t.get("family").and_then(Value::as_str), Some("inet"));
        assert!(t.get("port").is_none());
    }

    #[test]
    fn test_thread_value_copy() {
        let v = Value::from("payload");
        let t = v.to_thread_value().unwrap();
        assert_eq!(t, ThreadValue::String(b"payload".to_vec()));
        assert_eq!(t.into_value(), Some(v));
        assert!(Value::Object(ObjectRef(1)).to_thread_value().is_none());
    }
}

//! Argument checking for bound functions
//!
//! Positions are 1-based and errors read the way scripting users expect:
//! `bad argument #2 (number expected, got string)`.

use loopbind_sdk::{AbiResult, NativeError, ScriptContext, ThreadValue, Value};

/// Most values a thread, work request or async send can carry.
pub const MAX_THREAD_ARGS: usize = 9;

/// Positional view over a bound function's arguments.
pub(crate) struct Args<'a> {
    ctx: &'a dyn ScriptContext,
    values: &'a [Value],
}

static NIL: Value = Value::Nil;

impl<'a> Args<'a> {
    pub(crate) fn new(ctx: &'a dyn ScriptContext, values: &'a [Value]) -> Self {
        Self { ctx, values }
    }

    pub(crate) fn ctx(&self) -> &'a dyn ScriptContext {
        self.ctx
    }

    /// Argument at `index`; missing arguments read as nil.
    pub(crate) fn get(&self, index: usize) -> &'a Value {
        index
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NIL)
    }

    /// Arguments from `index` to the end.
    pub(crate) fn rest(&self, index: usize) -> &'a [Value] {
        let start = index.saturating_sub(1).min(self.values.len());
        &self.values[start..]
    }

    pub(crate) fn is_none_or_nil(&self, index: usize) -> bool {
        self.get(index).is_nil()
    }

    pub(crate) fn type_name(&self, index: usize) -> String {
        let value = self.get(index);
        match value {
            Value::Object(_) => self.ctx.type_name(value),
            _ if index > self.values.len() => "no value".to_string(),
            _ => value.type_name().to_string(),
        }
    }

    pub(crate) fn error(&self, index: usize, message: impl Into<String>) -> NativeError {
        NativeError::argument(index, message)
    }

    /// `bad argument #N (WHAT expected, got TYPE)`.
    pub(crate) fn expected(&self, index: usize, what: &str) -> NativeError {
        NativeError::argument(index, format!("{} expected, got {}", what, self.type_name(index)))
    }

    pub(crate) fn integer(&self, index: usize) -> AbiResult<i64> {
        match self.get(index) {
            Value::Number(n) if n.fract() != 0.0 => {
                Err(self.error(index, "number has no integer representation"))
            }
            v => v.as_integer().ok_or_else(|| self.expected(index, "number")),
        }
    }

    /// Integer that must fit `T`; `what` names it in the range error.
    pub(crate) fn integer_as<T: TryFrom<i64>>(&self, index: usize, what: &str) -> AbiResult<T> {
        let n = self.integer(index)?;
        T::try_from(n).map_err(|_| self.error(index, format!("{} out of range", what)))
    }

    pub(crate) fn opt_integer(&self, index: usize) -> AbiResult<Option<i64>> {
        if self.is_none_or_nil(index) {
            return Ok(None);
        }
        self.integer(index).map(Some)
    }

    pub(crate) fn number(&self, index: usize) -> AbiResult<f64> {
        self.get(index)
            .as_number()
            .ok_or_else(|| self.expected(index, "number"))
    }

    /// Byte string. Numbers are accepted and formatted.
    pub(crate) fn bytes(&self, index: usize) -> AbiResult<Vec<u8>> {
        match self.get(index) {
            Value::String(bytes) => Ok(bytes.clone()),
            Value::Integer(i) => Ok(i.to_string().into_bytes()),
            Value::Number(n) => Ok(n.to_string().into_bytes()),
            _ => Err(self.expected(index, "string")),
        }
    }

    pub(crate) fn string(&self, index: usize) -> AbiResult<String> {
        let bytes = self.bytes(index)?;
        String::from_utf8(bytes).map_err(|_| self.error(index, "invalid UTF-8 string"))
    }

    pub(crate) fn opt_string(&self, index: usize) -> AbiResult<Option<String>> {
        if self.is_none_or_nil(index) {
            return Ok(None);
        }
        self.string(index).map(Some)
    }

    pub(crate) fn boolean(&self, index: usize) -> bool {
        self.get(index).truthy()
    }

    pub(crate) fn table(&self, index: usize) -> AbiResult<&'a Value> {
        match self.get(index) {
            v @ (Value::Table(_) | Value::List(_)) => Ok(v),
            _ => Err(self.expected(index, "table")),
        }
    }

    pub(crate) fn opt_table(&self, index: usize) -> AbiResult<Option<&'a Value>> {
        if self.is_none_or_nil(index) {
            return Ok(None);
        }
        self.table(index).map(Some)
    }

    /// Something the runtime can call.
    pub(crate) fn callable(&self, index: usize) -> AbiResult<&'a Value> {
        let value = self.get(index);
        if self.ctx.is_callable(value) {
            Ok(value)
        } else {
            Err(self.error(index, format!("expected callable, got {}", self.type_name(index))))
        }
    }

    pub(crate) fn opt_callable(&self, index: usize) -> AbiResult<Option<&'a Value>> {
        if self.is_none_or_nil(index) {
            return Ok(None);
        }
        self.callable(index).map(Some)
    }

    /// Deep-copy arguments from `index` onwards for another thread.
    pub(crate) fn thread_values(&self, index: usize) -> AbiResult<Vec<ThreadValue>> {
        let rest = self.rest(index);
        if rest.len() > MAX_THREAD_ARGS {
            return Err(NativeError::Runtime(format!(
                "too many thread arguments, max {}",
                MAX_THREAD_ARGS
            )));
        }
        rest.iter()
            .enumerate()
            .map(|(offset, value)| self.thread_value(index + offset, value))
            .collect()
    }

    fn thread_value(&self, index: usize, value: &Value) -> AbiResult<ThreadValue> {
        if let Some(v) = value.to_thread_value() {
            return Ok(v);
        }
        crate::async_handle::port_of(self.ctx, value)
            .map(ThreadValue::Port)
            .ok_or_else(|| self.error(index, "thread argument not supported"))
    }
}

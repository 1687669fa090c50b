//! Values that may cross the wire as operation arguments or results.
//!
//! Arguments and results are JSON values restricted to scalars (null, bool,
//! number, string) and containers of at most [`MAX_NESTING`] levels. A flat
//! list or map of scalars is one level; a map whose entries are flat lists
//! (a composite measurement result) is two.

use crate::error::{PqnError, PqnResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Deepest container nesting accepted on the wire.
pub const MAX_NESTING: usize = 2;

/// Reject values nested deeper than [`MAX_NESTING`].
pub fn validate(value: &Value) -> PqnResult<()> {
    fn depth(value: &Value) -> usize {
        match value {
            Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
            Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    let d = depth(value);
    if d > MAX_NESTING {
        return Err(PqnError::Serialization(format!(
            "value nests {} containers deep, at most {} are allowed",
            d, MAX_NESTING
        )));
    }
    Ok(())
}

/// Convert any serializable value into a wire value.
pub fn to_wire<T: Serialize + ?Sized>(value: &T) -> PqnResult<Value> {
    let value = serde_json::to_value(value)?;
    validate(&value)?;
    Ok(value)
}

/// Arguments for a remote call, built fluently on the caller's side.
///
/// Conversion errors are kept until the call is made so that a bad argument
/// is reported before any request is sent.
#[derive(Debug, Default)]
pub struct Arguments {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    error: Option<String>,
}

impl Arguments {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        match to_wire(&value) {
            Ok(v) => self.args.push(v),
            Err(e) => self.record(format!("positional argument {}: {}", self.args.len(), e)),
        }
        self
    }

    /// Set a keyword argument.
    pub fn kwarg<T: Serialize>(mut self, name: &str, value: T) -> Self {
        match to_wire(&value) {
            Ok(v) => {
                self.kwargs.insert(name.to_string(), v);
            }
            Err(e) => self.record(format!("keyword argument '{}': {}", name, e)),
        }
        self
    }

    /// Build from already-decoded JSON, e.g. command-line input.
    pub fn from_json(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        let mut out = Self::new();
        for value in args {
            out = out.arg(value);
        }
        for (name, value) in kwargs {
            out = out.kwarg(&name, value);
        }
        out
    }

    fn record(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    /// Split into positional and keyword parts, or the first conversion error.
    pub fn into_parts(self) -> PqnResult<(Vec<Value>, BTreeMap<String, Value>)> {
        match self.error {
            Some(message) => Err(PqnError::Serialization(message)),
            None => Ok((self.args, self.kwargs)),
        }
    }
}

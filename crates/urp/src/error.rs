//! Application-level errors: the `Error` packet shape, and reifying it back
//! into something callers can match on.
//!
//! The wire carries an error as `name: str, additional: null | map | seq |
//! scalar`. There's no runtime class synthesis to key off here, so
//! [`ErrorKindCache`] interns the name itself: two errors are the same kind
//! iff their names compare equal, and the cache just avoids re-allocating
//! that name string on every occurrence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use urp_protocol::Value;

/// Fully qualified name of a method that isn't registered.
pub const NOT_A_METHOD: &str = ".NotAMethod";

/// Fully qualified name given to a method failure with no narrower
/// classification, e.g. one that raised a bare, unannotated error.
pub const GENERIC_ERROR: &str = ".GenericError";

/// An error reported by a remote method, or synthesized locally to describe
/// a transport failure.
#[derive(Debug, Clone)]
pub struct ApplicationError {
    pub name: Arc<str>,
    additional: Value,
}

impl ApplicationError {
    pub fn new(name: impl Into<Arc<str>>, additional: Value) -> Self {
        ApplicationError {
            name: name.into(),
            additional,
        }
    }

    pub fn not_a_method(fqn: impl Into<String>) -> Self {
        let message = format!("no such method: {}", fqn.into());
        Self::with_message(NOT_A_METHOD, message)
    }

    /// Null shape: just a name, no extra data.
    pub fn bare(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, Value::Nil)
    }

    /// Mapping shape, carrying at least a human-readable `msg`.
    pub fn with_message(name: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self::new(
            name,
            Value::Map(vec![(Value::from("msg"), Value::from(message.into()))]),
        )
    }

    /// Mapping shape with arbitrary fields.
    pub fn with_fields(name: impl Into<Arc<str>>, fields: Vec<(String, Value)>) -> Self {
        let map = fields
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect();
        Self::new(name, Value::Map(map))
    }

    /// Sequence shape: positional arguments.
    pub fn with_args(name: impl Into<Arc<str>>, args: Vec<Value>) -> Self {
        Self::new(name, Value::Array(args))
    }

    /// Scalar shape: one value, neither a map nor a sequence.
    pub fn with_scalar(name: impl Into<Arc<str>>, value: Value) -> Self {
        Self::new(name, value)
    }

    /// Synthesized locally when a transport is gone mid-call; never sent
    /// over the wire, only returned to a local caller.
    pub fn transport(cause: impl Into<String>) -> Self {
        Self::with_message(".Disconnected", cause.into())
    }

    pub fn additional(&self) -> &Value {
        &self.additional
    }

    /// The `msg` field, if this error uses the mapping-with-msg shape.
    pub fn message(&self) -> Option<&str> {
        match &self.additional {
            Value::Map(entries) => entries.iter().find_map(|(k, v)| {
                if k.as_str() == Some("msg") {
                    v.as_str()
                } else {
                    None
                }
            }),
            _ => None,
        }
    }

    /// Positional arguments, if this error uses the sequence shape.
    pub fn args(&self) -> Option<&[Value]> {
        match &self.additional {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Arbitrary fields, if this error uses the mapping shape.
    pub fn fields(&self) -> Option<&[(Value, Value)]> {
        match &self.additional {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.name, msg),
            None => write!(f, "{}", self.name),
        }
    }
}

impl std::error::Error for ApplicationError {}

/// Interns error names so repeated occurrences of the same remote error
/// share one allocation.
#[derive(Default)]
pub struct ErrorKindCache {
    names: Mutex<HashMap<String, Arc<str>>>,
}

impl ErrorKindCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, name: &str) -> Arc<str> {
        let mut names = self.names.lock();
        if let Some(existing) = names.get(name) {
            return existing.clone();
        }
        let interned: Arc<str> = Arc::from(name);
        names.insert(name.to_string(), interned.clone());
        interned
    }
}

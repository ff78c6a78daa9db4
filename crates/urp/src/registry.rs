//! Method registration for the server role.
//!
//! A method can be registered in one of four shapes: plain, async, a
//! synchronous generator, or an async generator. Rust has no runtime way to
//! introspect a closure's shape, so registration is explicit instead: four
//! `register_*` calls rather than one `register` that guesses.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_core::stream::BoxStream;
use parking_lot::RwLock;
use urp_protocol::Value;

use crate::error::ApplicationError;

pub type MethodResult = Result<Value, ApplicationError>;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One registered method, in the shape it was registered as.
#[derive(Clone)]
pub enum MethodHandler {
    /// Computes its result synchronously, without suspending.
    Plain(Arc<dyn Fn(Value) -> MethodResult + Send + Sync>),
    /// Computes its result asynchronously; exactly one `Return`.
    Coroutine(Arc<dyn Fn(Value) -> BoxFuture<'static, MethodResult> + Send + Sync>),
    /// Synchronously produces a sequence of values, one `Return` per item,
    /// driven to completion without yielding to the scheduler between items.
    Iterator(Arc<dyn Fn(Value) -> Result<Box<dyn Iterator<Item = MethodResult> + Send>, ApplicationError> + Send + Sync>),
    /// Asynchronously produces a sequence of values, one `Return` per item,
    /// each of which may suspend.
    AsyncIterator(Arc<dyn Fn(Value) -> Result<BoxStream<'static, MethodResult>, ApplicationError> + Send + Sync>),
}

/// Maps fully qualified method names (`"<interface>.<method>"`) to handlers.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, MethodHandler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_plain(
        &self,
        fqn: impl Into<String>,
        f: impl Fn(Value) -> MethodResult + Send + Sync + 'static,
    ) {
        self.insert(fqn, MethodHandler::Plain(Arc::new(f)));
    }

    pub fn register_coroutine<F, Fut>(&self, fqn: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.insert(
            fqn,
            MethodHandler::Coroutine(Arc::new(move |args| Box::pin(f(args)))),
        );
    }

    pub fn register_iterator(
        &self,
        fqn: impl Into<String>,
        f: impl Fn(Value) -> Result<Box<dyn Iterator<Item = MethodResult> + Send>, ApplicationError>
            + Send
            + Sync
            + 'static,
    ) {
        self.insert(fqn, MethodHandler::Iterator(Arc::new(f)));
    }

    pub fn register_async_iterator(
        &self,
        fqn: impl Into<String>,
        f: impl Fn(Value) -> Result<BoxStream<'static, MethodResult>, ApplicationError>
            + Send
            + Sync
            + 'static,
    ) {
        self.insert(fqn, MethodHandler::AsyncIterator(Arc::new(f)));
    }

    fn insert(&self, fqn: impl Into<String>, handler: MethodHandler) {
        self.methods.write().insert(fqn.into(), handler);
    }

    pub fn unregister(&self, fqn: &str) -> bool {
        self.methods.write().remove(fqn).is_some()
    }

    pub fn lookup(&self, fqn: &str) -> Option<MethodHandler> {
        self.methods.read().get(fqn).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_plain() {
        let registry = MethodRegistry::new();
        registry.register_plain("example.Echo", |v| Ok(v));
        assert!(matches!(
            registry.lookup("example.Echo"),
            Some(MethodHandler::Plain(_))
        ));
        assert!(registry.lookup("example.Missing").is_none());
    }

    #[test]
    fn unregister_removes_the_method() {
        let registry = MethodRegistry::new();
        registry.register_plain("example.Echo", Ok);
        assert!(registry.unregister("example.Echo"));
        assert!(registry.lookup("example.Echo").is_none());
        assert!(!registry.unregister("example.Echo"));
    }

    #[test]
    fn registering_the_same_name_twice_replaces_it() {
        let registry = MethodRegistry::new();
        registry.register_plain("example.Echo", |_| Ok(Value::from(1)));
        registry.register_plain("example.Echo", |_| Ok(Value::from(2)));
        match registry.lookup("example.Echo").unwrap() {
            MethodHandler::Plain(f) => assert_eq!(f(Value::Nil).unwrap(), Value::from(2)),
            _ => panic!("expected Plain"),
        }
    }
}

//! Named operations exposed by a device.
//!
//! Each driver fills an [`OperationRegistry`] once, at construction, mapping
//! operation names to async handlers. Handlers receive the driver state and a
//! [`CallArgs`] and return any serializable value. Invocation through the
//! registry is logged (name, arguments, outcome, duration) without touching
//! the handler's result.

use crate::device::value;
use crate::error::{PqnError, PqnResult};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Positional and keyword arguments of one invocation, plus its cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments in call order.
    pub args: Vec<Value>,
    /// Keyword arguments by name.
    pub kwargs: BTreeMap<String, Value>,
    cancel: CancellationToken,
}

impl CallArgs {
    /// Arguments with a fresh, never-cancelled token.
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            cancel: CancellationToken::new(),
        }
    }

    /// No arguments at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional(args: Vec<Value>) -> Self {
        Self::new(args, BTreeMap::new())
    }

    /// Replace the cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token fired when the caller gives up on this invocation.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `Cancelled` if the caller has given up.
    pub fn ensure_not_cancelled(&self) -> PqnResult<()> {
        if self.cancel.is_cancelled() {
            Err(PqnError::Cancelled("caller gave up".to_string()))
        } else {
            Ok(())
        }
    }

    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }

    /// Argument `name`, passed by keyword or at position `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> PqnResult<T> {
        let value = self
            .lookup(index, name)
            .ok_or_else(|| PqnError::InvalidArgument(format!("missing argument '{}'", name)))?;
        decode(name, value)
    }

    /// Like [`CallArgs::get`], with `default` when the argument is absent.
    pub fn get_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> PqnResult<T> {
        match self.lookup(index, name) {
            Some(Value::Null) | None => Ok(default),
            Some(value) => decode(name, value),
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> PqnResult<T> {
    T::deserialize(value).map_err(|e| {
        PqnError::InvalidArgument(format!("argument '{}' has the wrong type: {}", name, e))
    })
}

type Handler = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, PqnResult<Value>> + Send + Sync>;

/// Operation name to handler mapping of one driver.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

impl OperationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, giving it a shared handle to `state`.
    ///
    /// Registering the same name twice replaces the earlier handler.
    pub fn register<S, F, Fut, T>(&mut self, name: &str, state: &Arc<S>, handler: F) -> &mut Self
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PqnResult<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let state = Arc::clone(state);
        let wrapped: Handler = Arc::new(
            move |args: CallArgs| -> BoxFuture<'static, PqnResult<Value>> {
                let fut = handler(Arc::clone(&state), args);
                Box::pin(async move {
                    let output = fut.await?;
                    value::to_wire(&output)
                })
            },
        );
        self.handlers.insert(name.to_string(), wrapped);
        self
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when no operation is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `operation` and log the call.
    pub async fn invoke(&self, device: &str, operation: &str, args: CallArgs) -> PqnResult<Value> {
        let handler = self.handlers.get(operation).ok_or_else(|| {
            PqnError::NotFound(format!(
                "operation '{}' not found in '{}'",
                operation, device
            ))
        })?;

        info!(
            device,
            operation,
            args = ?args.args,
            kwargs = ?args.kwargs,
            "Operation started"
        );
        let started = Instant::now();
        let result = handler(args).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(output) => info!(
                device,
                operation,
                elapsed_ms,
                result = %output,
                "Operation completed"
            ),
            Err(e) => warn!(
                device,
                operation,
                elapsed_ms,
                kind = %e.kind(),
                error = %e,
                "Operation failed"
            ),
        }
        result
    }
}

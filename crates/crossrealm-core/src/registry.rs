//! Per-realm table of call handlers.
//!
//! Handlers are registered once at realm start-up and live as long as the
//! realm. Registering a call type a second time keeps the first handler and
//! logs a warning, so re-running a registration block is harmless.

use crate::channel::ChannelHandle;
use crate::codec::RemoteError;
use crate::envelope::{CallType, Meta};
use crate::realm::SenderDescriptor;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// How the caller observes a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// The caller awaits the handler's result or error.
    Request,
    /// Fire-and-forget: the result is discarded and failures are only logged.
    Notification,
}

/// Where a call came from and the channel it arrived on.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub sender: SenderDescriptor,
    pub channel: ChannelHandle,
    pub meta: Meta,
}

/// A handler for one call type.
///
/// Implemented for any `Fn(CallContext, Vec<Value>) -> impl Future<Output =
/// anyhow::Result<Value>>`, so plain async closures can be registered.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> anyhow::Result<Value> {
        (self)(ctx, args).await
    }
}

/// Adapts a typed handler (`A` is a tuple of arguments) to [`Handler`].
pub struct TypedHandler<F, A, R> {
    call_type: CallType,
    func: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> TypedHandler<F, A, R> {
    pub fn new(call_type: CallType, func: F) -> Self {
        Self {
            call_type,
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A, R> Handler for TypedHandler<F, A, R>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> anyhow::Result<Value> {
        let args: A = decode_args(args).map_err(|e| {
            RemoteError::request_failed(format!("Invalid arguments for {}: {}", self.call_type, e))
        })?;
        let result = (self.func)(ctx, args).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Encode an argument tuple as the ordered payload array.
pub(crate) fn encode_args<A: Serialize>(args: &A) -> serde_json::Result<Vec<Value>> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(values) => values,
        single => vec![single],
    })
}

/// Decode the ordered payload array into an argument tuple.
pub(crate) fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> serde_json::Result<A> {
    if args.is_empty() {
        // `()` only deserializes from null.
        if let Ok(unit) = serde_json::from_value(Value::Null) {
            return Ok(unit);
        }
    }
    serde_json::from_value(Value::Array(args))
}

/// A registered handler and how it is invoked.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn Handler>,
    pub invocation: Invocation,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

/// Call type to handler table for one realm.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<CallType, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `false` (and keeps the existing handler)
    /// if the call type is already taken.
    pub fn register(
        &self,
        call_type: CallType,
        handler: Arc<dyn Handler>,
        invocation: Invocation,
    ) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&call_type) {
            warn!(call_type = %call_type, "handler already registered; keeping the first registration");
            return false;
        }
        debug!(call_type = %call_type, ?invocation, "registered handler");
        handlers.insert(call_type, HandlerEntry { handler, invocation });
        true
    }

    pub fn lookup(&self, call_type: &CallType) -> Option<HandlerEntry> {
        self.handlers.read().get(call_type).cloned()
    }

    pub fn contains(&self, call_type: &CallType) -> bool {
        self.handlers.read().contains_key(call_type)
    }

    /// Registered call types, sorted.
    pub fn call_types(&self) -> Vec<CallType> {
        let mut types: Vec<CallType> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

//! Handler registry: maps message kinds to the handlers that answer them.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::NestError;
use crate::identity::NestId;
use crate::message::{MessageKind, Payload};
use crate::nest::Nest;
use crate::network::Network;

/// What a handler gets to work with: the nest the request arrived at and the
/// network it can send further requests through.
#[derive(Clone)]
pub struct NestContext {
    pub network: Network,
    pub nest: Nest,
}

impl NestContext {
    pub fn id(&self) -> &NestId {
        self.nest.id()
    }
}

/// A handler in the uniform shape stored by the registry.
pub type Handler = Arc<
    dyn Fn(NestContext, Payload, NestId) -> BoxFuture<'static, Result<Payload, NestError>>
        + Send
        + Sync,
>;

/// One handler per [`MessageKind`].
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    /// Create a new registry with no handlers registered.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous handler for the kind.
    pub fn register(&mut self, kind: &MessageKind, handler: Handler) {
        let key = kind.dispatch_key();
        if self.handlers.insert(key.clone(), handler).is_some() {
            debug!("Replaced handler for message kind: {key}");
        } else {
            debug!("Registering handler for message kind: {key}");
        }
    }

    /// Check if a handler is registered for a specific message kind.
    pub fn has_handler(&self, kind: &MessageKind) -> bool {
        self.handlers.contains_key(&kind.dispatch_key())
    }

    /// Look up the handler for a kind. The handler is cloned out so the
    /// registry lock is not held while it runs.
    pub fn get(&self, kind: &MessageKind) -> Option<Handler> {
        self.handlers.get(&kind.dispatch_key()).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Handler adapters
// ---------------------------------------------------------------------------

/// Wrap an async producer into a [`Handler`].
///
/// Failures returned by the producer's future are passed through. A panic,
/// whether raised while building the future or while polling it, becomes a
/// [`NestError::Handler`] instead of tearing down the nest's task.
pub fn handler_fn<F, Fut>(producer: F) -> Handler
where
    F: Fn(NestContext, Payload, NestId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, NestError>> + Send + 'static,
{
    let producer = Arc::new(producer);
    Arc::new(move |ctx, content, source| {
        let producer = Arc::clone(&producer);
        Box::pin(async move {
            let fut = std::panic::catch_unwind(AssertUnwindSafe(|| {
                producer(ctx, content, source)
            }))
            .map_err(panic_to_error)?;
            AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_to_error(panic)))
        })
    })
}

/// Wrap a producer that answers immediately into a [`Handler`].
pub fn sync_handler_fn<F>(producer: F) -> Handler
where
    F: Fn(&NestContext, Payload, &NestId) -> Result<Payload, NestError> + Send + Sync + 'static,
{
    let producer = Arc::new(producer);
    handler_fn(move |ctx, content, source| {
        let result = producer(&ctx, content, &source);
        async move { result }
    })
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> NestError {
    let reason = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    NestError::Handler(format!("handler panicked: {reason}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

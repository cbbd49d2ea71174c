use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::envelope::{AnyPayload, Envelope, Message, TypeRegistry};
use crate::error::{Error, Result};
use crate::partition::{KeyFallback, PartitionKeyResolver};

type HandlerFn = Arc<dyn Fn(Envelope, AnyPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Record of handled message ids, used to neutralize redelivery.
#[async_trait]
pub trait ProcessedMessageLog: Send + Sync {
    async fn contains(&self, message_id: &str) -> Result<bool>;
    async fn record(&self, message_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryProcessedLog {
    ids: Mutex<HashSet<String>>,
}

impl InMemoryProcessedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

#[async_trait]
impl ProcessedMessageLog for InMemoryProcessedLog {
    async fn contains(&self, message_id: &str) -> Result<bool> {
        Ok(self.ids.lock().contains(message_id))
    }

    async fn record(&self, message_id: &str) -> Result<()> {
        self.ids.lock().insert(message_id.to_string());
        Ok(())
    }
}

/// What happened to a delivered envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    Handled,
    /// Already in the processed log; the handler was skipped.
    Duplicate,
}

/// Dispatch table keyed by payload type name.
///
/// Registering a handler also registers the payload decoder and caches the
/// type's partition key binding.
pub struct HandlerRegistry {
    types: TypeRegistry,
    resolver: Arc<PartitionKeyResolver>,
    binders: Vec<fn(&PartitionKeyResolver)>,
    handlers: HashMap<&'static str, HandlerFn>,
    processed: Option<Arc<dyn ProcessedMessageLog>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            types: TypeRegistry::new(),
            resolver: Arc::new(PartitionKeyResolver::new()),
            binders: Vec::new(),
            handlers: HashMap::new(),
            processed: None,
        }
    }

    /// Use a shared resolver, e.g. one with key functions registered.
    pub fn with_resolver(mut self, resolver: Arc<PartitionKeyResolver>) -> Self {
        for bind in &self.binders {
            bind(&resolver);
        }
        self.resolver = resolver;
        self
    }

    /// Skip envelopes whose `MessageId` is already recorded, and record each
    /// one after its handler succeeds.
    pub fn with_processed_log(mut self, log: Arc<dyn ProcessedMessageLog>) -> Self {
        self.processed = Some(log);
        self
    }

    pub fn on<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Message,
        F: Fn(Arc<M>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.types.register::<M>();
        self.resolver.bind::<M>();
        self.binders.push(PartitionKeyResolver::bind::<M>);

        let erased: HandlerFn = Arc::new(move |envelope, payload: AnyPayload| {
            match payload.downcast::<M>() {
                Ok(message) => handler(message, envelope).boxed(),
                Err(_) => future::ready(Err(Error::deserialization(
                    M::TYPE_NAME,
                    "decoded payload has a different type",
                )))
                .boxed(),
            }
        });

        if self.handlers.insert(M::TYPE_NAME, erased).is_some() {
            tracing::warn!(message_type = M::TYPE_NAME, "handler replaced");
        }
        self
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn resolver(&self) -> &Arc<PartitionKeyResolver> {
        &self.resolver
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Mailbox key for `envelope`.
    ///
    /// Tries the resolver binding for the payload type, then the `Key`
    /// header, then the type name when the resolver allows it, and finally
    /// `lane` (the partition the envelope was read from).
    pub fn partition_key(&self, envelope: &Envelope, lane: &str) -> Result<String> {
        let payload = envelope.materialize(&self.types)?;
        let type_name = envelope.payload_type().unwrap_or_default();

        let key = self
            .resolver
            .resolve_dynamic(type_name, &*payload)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| non_blank(envelope.key()))
            .or_else(|| match self.resolver.fallback() {
                KeyFallback::TypeName => non_blank(Some(type_name)),
                KeyFallback::Reject => None,
            })
            .unwrap_or_else(|| lane.to_string());
        Ok(key)
    }

    /// Decode `envelope` and run its handler.
    pub async fn handle(&self, envelope: &Envelope) -> Result<HandleOutcome> {
        let payload = envelope.materialize(&self.types)?;
        let type_name = envelope.payload_type().unwrap_or_default();
        let handler = self
            .handlers
            .get(type_name)
            .ok_or_else(|| Error::deserialization(type_name, "no handler registered"))?;

        if let Some(log) = &self.processed {
            if log.contains(envelope.message_id()).await? {
                tracing::debug!(
                    message_id = %envelope.message_id(),
                    message_type = type_name,
                    "duplicate delivery skipped"
                );
                return Ok(HandleOutcome::Duplicate);
            }
        }

        handler(envelope.clone(), payload).await?;

        if let Some(log) = &self.processed {
            log.record(envelope.message_id()).await?;
        }
        Ok(HandleOutcome::Handled)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &types)
            .field("resolver", &self.resolver)
            .field("dedup", &self.processed.is_some())
            .finish()
    }
}

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::envelope::Message;
use crate::error::{Error, Result};

type KeyFn = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;

/// What to do when a message type has neither a key function nor a
/// `#[message(key)]` field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyFallback {
    /// Refuse to route the message.
    #[default]
    Reject,
    /// Use the type name, putting every instance of the type in one lane.
    TypeName,
}

#[derive(Clone)]
enum Binding {
    Function(KeyFn),
    Field(KeyFn),
}

impl Binding {
    fn key_fn(&self) -> &KeyFn {
        match self {
            Binding::Function(f) | Binding::Field(f) => f,
        }
    }
}

/// Derives ordering keys from commands and events.
///
/// Resolution order for a type:
/// 1. a function registered with [`register_fn`](Self::register_fn)
/// 2. the field marked `#[message(key)]`
/// 3. the type name, only with [`KeyFallback::TypeName`]
///
/// Bindings are cached per type name; a concurrent first use may bind twice
/// but always to the same extractor.
pub struct PartitionKeyResolver {
    bindings: RwLock<HashMap<&'static str, Binding>>,
    fallback: KeyFallback,
}

impl Default for PartitionKeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionKeyResolver {
    pub fn new() -> Self {
        Self::with_fallback(KeyFallback::Reject)
    }

    pub fn with_fallback(fallback: KeyFallback) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    pub fn fallback(&self) -> KeyFallback {
        self.fallback
    }

    /// Register an explicit key function for `M`. A second registration for
    /// the same type is rejected.
    pub fn register_fn<M, F>(&self, key_fn: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M) -> String + Send + Sync + 'static,
    {
        let mut bindings = self.bindings.write();
        if let Some(Binding::Function(_)) = bindings.get(M::TYPE_NAME) {
            return Err(Error::Validation(format!(
                "a partition key function is already registered for {}",
                M::TYPE_NAME
            )));
        }

        let erased: KeyFn = Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<M>().map(|message| key_fn(message))
        });
        bindings.insert(M::TYPE_NAME, Binding::Function(erased));
        Ok(())
    }

    /// Cache the marked-field extractor for `M` so it can be resolved from a
    /// type-erased payload. No-op when `M` has no marked field or already has
    /// a binding.
    pub fn bind<M: Message>(&self) {
        if !M::HAS_PARTITION_KEY || self.bindings.read().contains_key(M::TYPE_NAME) {
            return;
        }

        let extractor: KeyFn = Arc::new(|value: &dyn Any| {
            value
                .downcast_ref::<M>()
                .and_then(|message| message.partition_key())
        });
        self.bindings
            .write()
            .entry(M::TYPE_NAME)
            .or_insert(Binding::Field(extractor));
    }

    pub fn is_bound(&self, type_name: &str) -> bool {
        self.bindings.read().contains_key(type_name)
    }

    /// Resolve the key for a typed message.
    pub fn resolve<M: Message>(&self, message: &M) -> Result<String> {
        let binding = self.bindings.read().get(M::TYPE_NAME).cloned();
        let binding = match binding {
            Some(binding) => Some(binding),
            None if M::HAS_PARTITION_KEY => {
                self.bind::<M>();
                self.bindings.read().get(M::TYPE_NAME).cloned()
            }
            None => None,
        };

        let value: &dyn Any = message;
        if let Some(key) = binding.and_then(|b| (b.key_fn())(value)) {
            return Ok(key);
        }

        match self.fallback {
            KeyFallback::TypeName => Ok(M::TYPE_NAME.to_string()),
            KeyFallback::Reject => Err(Error::Validation(format!(
                "no partition key for {}: register a key function or mark a key field",
                M::TYPE_NAME
            ))),
        }
    }

    /// Resolve from a decoded payload whose type is known only by name.
    /// Returns `None` when the type has no binding; fallback is left to the
    /// caller.
    pub fn resolve_dynamic(&self, type_name: &str, payload: &dyn Any) -> Option<String> {
        let binding = self.bindings.read().get(type_name).cloned()?;
        (binding.key_fn())(payload)
    }
}

impl std::fmt::Debug for PartitionKeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bindings = self.bindings.read();
        let mut types: Vec<_> = bindings.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("PartitionKeyResolver")
            .field("types", &types)
            .field("fallback", &self.fallback)
            .finish()
    }
}

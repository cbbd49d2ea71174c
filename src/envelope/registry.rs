use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::codec::PayloadCodec;
use super::message::Message;

/// A decoded payload whose concrete type is known only at runtime.
pub type AnyPayload = Arc<dyn Any + Send + Sync>;

type DecodeFn = fn(&[u8], PayloadCodec) -> Result<AnyPayload, String>;

/// Startup-built table mapping payload type names to decoders.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.decoders.insert(M::TYPE_NAME, decode_erased::<M>);
        self
    }

    pub fn with<M: Message>(mut self) -> Self {
        self.register::<M>();
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        self.decoders.keys().copied().collect()
    }

    pub(crate) fn decode(
        &self,
        type_name: &str,
        bytes: &[u8],
        codec: PayloadCodec,
    ) -> Result<AnyPayload, String> {
        let decode = self
            .decoders
            .get(type_name)
            .ok_or_else(|| format!("type {} is not registered", type_name))?;
        decode(bytes, codec)
    }
}

fn decode_erased<M: Message>(bytes: &[u8], codec: PayloadCodec) -> Result<AnyPayload, String> {
    let value: M = codec.decode(bytes)?;
    Ok(Arc::new(value))
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

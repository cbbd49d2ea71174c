use serde::de::DeserializeOwned;
use serde::Serialize;

/// A command or event that can travel inside an [`Envelope`](super::Envelope).
///
/// Usually derived with `#[derive(Message)]`, which fills in `TYPE_NAME`,
/// the declared topic, and the `#[message(key)]` partition field.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable payload type name carried in the `MessageType` header.
    const TYPE_NAME: &'static str;

    /// Whether `partition_key` reads a marked field.
    const HAS_PARTITION_KEY: bool = false;

    /// Topic (category) the message is published to.
    fn topic(&self) -> Option<String> {
        None
    }

    /// Value of the marked partition key field.
    fn partition_key(&self) -> Option<String> {
        None
    }

    /// Message id to preserve instead of generating one.
    fn message_id(&self) -> Option<String> {
        None
    }
}

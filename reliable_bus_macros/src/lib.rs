mod message;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Message)]
// ============================================================================

/// Derive macro implementing `reliable_bus::Message`.
///
/// The payload type name defaults to the struct name and can be overridden
/// with `#[message(name = "...")]`. A topic is declared with
/// `#[message(topic = "...")]`.
///
/// Mark the field that routes the message to its ordered lane with
/// `#[message(key)]`. Its value is converted with `ToString` when the
/// partition key is resolved. Mark a field with `#[message(id)]` to reuse it as
/// the envelope's message id instead of generating a fresh one.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Message)]
/// #[message(topic = "accounts")]
/// struct Transfer {
///     #[message(key)]
///     account_id: String,
///     amount: i64,
/// }
/// ```
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    message::derive_message(input)
}

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialization format of an envelope payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadCodec {
    #[default]
    Json,
    /// Compact binary encoding.
    #[cfg(feature = "bitcode")]
    Bitcode,
}

impl PayloadCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadCodec::Json => "application/json",
            #[cfg(feature = "bitcode")]
            PayloadCodec::Bitcode => "application/x-bitcode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "application/json" => Some(PayloadCodec::Json),
            #[cfg(feature = "bitcode")]
            "application/x-bitcode" => Some(PayloadCodec::Bitcode),
            _ => None,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, String> {
        match self {
            PayloadCodec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            #[cfg(feature = "bitcode")]
            PayloadCodec::Bitcode => bitcode::serialize(value).map_err(|e| e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, String> {
        match self {
            PayloadCodec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            #[cfg(feature = "bitcode")]
            PayloadCodec::Bitcode => bitcode::deserialize(bytes).map_err(|e| e.to_string()),
        }
    }
}

/// Serde adapter storing raw payload bytes as base64 text.
pub(crate) mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

use crate::types::{AdapterError, TokenId};

/// Text/token-id mapping capability owned by a backend.
///
/// Decoding a single id is not assumed to round-trip to the substring that
/// produced it: subword encoders split words across ids and are
/// context-sensitive at boundaries. Stop-sequence canonicalization
/// ([`crate::stopper::canonical_stop_ids`]) exists to cope with exactly that.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>, AdapterError>;

    fn decode(&self, ids: &[TokenId]) -> Result<String, AdapterError>;
}

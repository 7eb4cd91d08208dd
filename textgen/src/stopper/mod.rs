use crate::types::{FinishReason, TokenId};

/// Core trait for deciding when a token-level generation loop must halt.
///
/// `observe` is called with the full id sequence generated so far, after
/// every newly sampled id, so generation can stop early instead of only
/// being truncated after the fact.
pub trait Stopper: Send {
    fn observe(&mut self, generated: &[TokenId]) -> Option<FinishReason>;
}

pub mod keywords;
pub mod max_tokens;

pub use keywords::{canonical_stop_ids, KeywordStopper};
pub use max_tokens::MaxTokensStopper;

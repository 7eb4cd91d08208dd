use super::Stopper;
use crate::types::{FinishReason, TokenId};

/// Stops generation once a configured number of new tokens has been produced.
pub struct MaxTokensStopper {
    max_tokens: usize,
}

impl MaxTokensStopper {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

impl Stopper for MaxTokensStopper {
    fn observe(&mut self, generated: &[TokenId]) -> Option<FinishReason> {
        (generated.len() >= self.max_tokens).then_some(FinishReason::MaxTokens)
    }
}

use super::Stopper;
use crate::tokenizer::Tokenizer;
use crate::types::{AdapterError, FinishReason, StopSpecification, TokenId};
use tracing::debug;

/// Derive the canonical (shortest) token-id encoding of a stop string.
///
/// The naive encoding of a stop string can carry boundary tokens that will
/// never appear when the model produces that exact text mid-stream, so the
/// encoding is trimmed from the head and from the tail, keeping a candidate
/// only while the remaining ids still decode to the stop string exactly.
/// The shortest candidate wins; equal-length ties go to the head-trimmed
/// candidate because head candidates are collected first and the sort is
/// stable.
pub fn canonical_stop_ids(
    stop: &str,
    tokenizer: &dyn Tokenizer,
) -> Result<Vec<TokenId>, AdapterError> {
    let ids = tokenizer.encode(stop, false)?;
    let mut candidates: Vec<Vec<TokenId>> = Vec::new();

    for trim in 0..ids.len() {
        let suffix = &ids[trim..];
        if tokenizer.decode(suffix)? == stop {
            candidates.push(suffix.to_vec());
        } else {
            break;
        }
    }

    // The tail scan only makes sense when the untrimmed encoding matched,
    // which is exactly when the head scan collected at least one candidate.
    if !candidates.is_empty() {
        for trim in 1..ids.len() {
            let prefix = &ids[..ids.len() - trim];
            if tokenizer.decode(prefix)? == stop {
                candidates.push(prefix.to_vec());
            } else {
                break;
            }
        }
    }

    if candidates.is_empty() {
        return Err(AdapterError::InvalidStopSequence(stop.to_string()));
    }

    candidates.sort_by_key(|c| c.len());
    Ok(candidates.remove(0))
}

/// Token-level stop-sequence matcher: halts generation as soon as the
/// generated id sequence ends with the canonical encoding of any stop string.
pub struct KeywordStopper {
    sequences: Vec<Vec<TokenId>>,
}

impl KeywordStopper {
    pub fn from_spec(
        spec: &StopSpecification,
        tokenizer: &dyn Tokenizer,
    ) -> Result<Self, AdapterError> {
        let mut sequences = Vec::with_capacity(spec.entries().len());
        for stop in spec.entries() {
            let ids = canonical_stop_ids(stop, tokenizer)?;
            debug!(stop, ids = ids.len(), "canonicalized stop sequence");
            sequences.push(ids);
        }
        Ok(Self { sequences })
    }

    pub fn matches(&self, generated: &[TokenId]) -> bool {
        self.sequences.iter().any(|seq| generated.ends_with(seq))
    }
}

impl Stopper for KeywordStopper {
    fn observe(&mut self, generated: &[TokenId]) -> Option<FinishReason> {
        self.matches(generated).then_some(FinishReason::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Table-driven tokenizer whose per-id decodes deliberately do not
    /// round-trip, mimicking subword boundary artifacts.
    struct TableTokenizer {
        encodings: HashMap<String, Vec<TokenId>>,
        pieces: HashMap<TokenId, String>,
    }

    impl TableTokenizer {
        fn new(entries: &[(&str, &[TokenId])], pieces: &[(TokenId, &str)]) -> Self {
            Self {
                encodings: entries
                    .iter()
                    .map(|(s, ids)| (s.to_string(), ids.to_vec()))
                    .collect(),
                pieces: pieces
                    .iter()
                    .map(|(id, s)| (*id, s.to_string()))
                    .collect(),
            }
        }
    }

    impl Tokenizer for TableTokenizer {
        fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<TokenId>, AdapterError> {
            self.encodings
                .get(text)
                .cloned()
                .ok_or_else(|| AdapterError::Backend(format!("no encoding for {text:?}")))
        }

        fn decode(&self, ids: &[TokenId]) -> Result<String, AdapterError> {
            Ok(ids
                .iter()
                .map(|id| self.pieces.get(id).cloned().unwrap_or_default())
                .collect())
        }
    }

    /// "</s>" naively encodes to [7, 8, 9] where 7 decodes to "" (a boundary
    /// artifact), so the canonical sequence is the shorter [8, 9].
    fn boundary_tokenizer() -> TableTokenizer {
        TableTokenizer::new(
            &[("</s>", &[7, 8, 9])],
            &[(7, ""), (8, "</"), (9, "s>")],
        )
    }

    #[test]
    fn test_canonical_sequence_decodes_to_stop_string() {
        let tok = boundary_tokenizer();
        let ids = canonical_stop_ids("</s>", &tok).unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), "</s>");
    }

    #[test]
    fn test_canonical_sequence_is_minimal() {
        let tok = boundary_tokenizer();
        let ids = canonical_stop_ids("</s>", &tok).unwrap();
        assert_eq!(ids, vec![8, 9]);
    }

    #[test]
    fn test_untrimmable_encoding_is_canonical() {
        let tok = TableTokenizer::new(&[("stop", &[1, 2])], &[(1, "st"), (2, "op")]);
        assert_eq!(canonical_stop_ids("stop", &tok).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_non_decodable_stop_string_is_rejected() {
        // The naive encoding never decodes back to the stop string, e.g. a
        // tokenizer that folds leading whitespace away.
        let tok = TableTokenizer::new(&[(" stop", &[1, 2])], &[(1, "st"), (2, "op")]);
        assert!(matches!(
            canonical_stop_ids(" stop", &tok),
            Err(AdapterError::InvalidStopSequence(_))
        ));
    }

    #[test]
    fn test_matcher_requires_exact_suffix() {
        let tok = boundary_tokenizer();
        let spec = StopSpecification::new(vec!["</s>"]).unwrap();
        let stopper = KeywordStopper::from_spec(&spec, &tok).unwrap();

        assert!(stopper.matches(&[42, 8, 9]));
        assert!(stopper.matches(&[8, 9]));
        // Suffix differing by one id does not match.
        assert!(!stopper.matches(&[42, 8, 10]));
        assert!(!stopper.matches(&[42, 7, 9]));
        // Too short to contain the sequence.
        assert!(!stopper.matches(&[9]));
        assert!(!stopper.matches(&[]));
        // The sequence appearing mid-stream (not as suffix) does not match.
        assert!(!stopper.matches(&[8, 9, 42]));
    }

    #[test]
    fn test_observe_reports_stop() {
        let tok = boundary_tokenizer();
        let spec = StopSpecification::new(vec!["</s>"]).unwrap();
        let mut stopper = KeywordStopper::from_spec(&spec, &tok).unwrap();

        assert_eq!(stopper.observe(&[1, 2]), None);
        assert_eq!(stopper.observe(&[1, 2, 8, 9]), Some(FinishReason::Stop));
    }
}

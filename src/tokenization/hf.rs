use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Result;
use crate::tokenization::bbpe::parse_merge;
use crate::tokenization::vocab::Vocab;

/// Serialized state of a foreign ("Hugging Face style") tokenizer:
/// `{model: {vocab, merges}, bos_token, eos_token}`. Unknown fields are
/// ignored.
#[derive(Debug, Deserialize)]
pub struct HfTokenizerState {
    pub model: HfTokenizerModel,
    #[serde(default)]
    pub bos_token: Option<String>,
    #[serde(default)]
    pub eos_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HfTokenizerModel {
    pub vocab: HashMap<String, u32>,
    pub merges: Vec<String>,
}

impl HfTokenizerState {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Turn the serialized piece map and `"piece1 piece2"` merge strings
    /// into the local vocabulary/merge representation.
    pub fn into_vocab_and_merges(self) -> Result<(Vocab, Vec<(String, String)>)> {
        let vocab = Vocab::from_id_map(self.model.vocab)?;
        let merges = self
            .model
            .merges
            .iter()
            .map(|rule| parse_merge(rule))
            .collect::<Result<Vec<_>>>()?;
        Ok((vocab, merges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_exact_documented_shape() {
        let json = r#"{
            "version": "1.0",
            "model": {
                "type": "BPE",
                "vocab": {"<s>": 0, "</s>": 1, "a": 2, "b": 3, "ab": 4},
                "merges": ["a b"]
            },
            "bos_token": "<s>",
            "eos_token": "</s>"
        }"#;
        let state = HfTokenizerState::from_json(json).unwrap();
        assert_eq!(state.bos_token.as_deref(), Some("<s>"));
        assert_eq!(state.eos_token.as_deref(), Some("</s>"));
        let (vocab, merges) = state.into_vocab_and_merges().unwrap();
        assert_eq!(vocab.piece_id("ab"), Some(4));
        assert_eq!(merges, vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn malformed_merge_is_rejected() {
        let json = r#"{"model": {"vocab": {"a": 0}, "merges": ["nospace"]}}"#;
        let state = HfTokenizerState::from_json(json).unwrap();
        assert!(state.into_vocab_and_merges().is_err());
    }
}

use std::path::Path;

use crate::error::{LmError, Result};
use crate::tokenization::bbpe::ByteBpe;
use crate::tokenization::hf::HfTokenizerState;
use crate::tokenization::pieces::PiecesWithIds;
use crate::tokenization::tokenizer::{MarkerPostEncoder, MarkerPreDecoder, Tokenizer};
use crate::tokenization::vocab::Vocab;

#[derive(Debug, Clone)]
pub struct RobertaTokenizerConfig {
    pub bos_piece: String,
    pub eos_piece: String,
}

impl Default for RobertaTokenizerConfig {
    fn default() -> Self {
        RobertaTokenizerConfig {
            bos_piece: "<s>".to_string(),
            eos_piece: "</s>".to_string(),
        }
    }
}

/// Byte-level BPE pipeline with `<s>`/`</s>` markers. The splitter works on
/// raw text, so no pre-encoder runs before it.
#[derive(Debug, Clone)]
pub struct RobertaTokenizer {
    bbpe: ByteBpe,
    post_encoder: MarkerPostEncoder,
    pre_decoder: MarkerPreDecoder,
}

impl RobertaTokenizer {
    pub fn new(bbpe: ByteBpe, config: RobertaTokenizerConfig) -> Result<Self> {
        let post_encoder =
            MarkerPostEncoder::new(bbpe.vocab(), &config.bos_piece, &config.eos_piece)?;
        let pre_decoder =
            MarkerPreDecoder::new([post_encoder.bos_id(), post_encoder.eos_id()]);
        Ok(RobertaTokenizer {
            bbpe,
            post_encoder,
            pre_decoder,
        })
    }

    /// Construct from line-oriented vocabulary and merge files.
    pub fn from_files(
        vocab_path: &Path,
        merges_path: &Path,
        config: RobertaTokenizerConfig,
    ) -> Result<Self> {
        Self::new(ByteBpe::from_files(vocab_path, merges_path)?, config)
    }

    /// Construct from a foreign tokenizer's serialized state. Given the
    /// same vocabulary and merges, the resulting pipeline encodes and
    /// decodes identically to a file-built one.
    pub fn from_hf_tokenizer_json(json: &str) -> Result<Self> {
        let state = HfTokenizerState::from_json(json)?;
        let mut config = RobertaTokenizerConfig::default();
        if let Some(bos) = &state.bos_token {
            config.bos_piece = bos.clone();
        }
        if let Some(eos) = &state.eos_token {
            config.eos_piece = eos.clone();
        }
        let (vocab, merges) = state.into_vocab_and_merges()?;
        Self::new(ByteBpe::new(vocab, merges)?, config)
    }

    pub fn vocab(&self) -> &Vocab {
        self.bbpe.vocab()
    }
}

impl Tokenizer for RobertaTokenizer {
    fn encode(&self, texts: &[&str]) -> Result<PiecesWithIds> {
        let mut out = PiecesWithIds::default();
        for text in texts {
            let mut ids = Vec::new();
            let mut pieces = Vec::new();
            let mut lens = Vec::new();
            for word in self.bbpe.split_text(text)? {
                lens.push(word.len());
                for (piece, id) in word {
                    pieces.push(piece);
                    ids.push(id);
                }
            }
            out.ids.push(ids);
            out.pieces.push(pieces);
            out.lens.push(lens);
        }
        Ok(self.post_encoder.post_encode(out))
    }

    fn decode(&self, ids: &[Vec<u32>]) -> Result<Vec<String>> {
        let stripped = self.pre_decoder.pre_decode(ids);
        stripped
            .iter()
            .map(|seq| {
                let pieces = seq
                    .iter()
                    .map(|&id| {
                        self.vocab()
                            .id_to_piece(id)
                            .ok_or(LmError::UnknownPieceId(id))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.bbpe.join_pieces(pieces))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOY_JSON: &str = r#"{
        "model": {
            "vocab": {
                "<s>": 0, "</s>": 1,
                "h": 2, "e": 3, "l": 4, "o": 5, "w": 6, "r": 7, "d": 8, "Ġ": 9,
                "he": 10, "hel": 11, "hell": 12, "hello": 13,
                "Ġw": 14, "or": 15, "orl": 16, "orld": 17, "Ġworld": 18
            },
            "merges": [
                "h e", "he l", "hel l", "hell o",
                "Ġ w", "o r", "or l", "orl d", "Ġw orld"
            ]
        },
        "bos_token": "<s>",
        "eos_token": "</s>"
    }"#;

    #[test]
    fn encode_wraps_with_markers() {
        let tokenizer = RobertaTokenizer::from_hf_tokenizer_json(TOY_JSON).unwrap();
        let encoding = tokenizer.encode(&["hello world"]).unwrap();
        assert_eq!(encoding.pieces[0], ["<s>", "hello", "\u{120}world", "</s>"]);
        assert_eq!(encoding.ids[0], vec![0, 13, 18, 1]);
        assert_eq!(encoding.lens[0], vec![1, 1, 1, 1]);
    }

    #[test]
    fn decode_round_trips() {
        let tokenizer = RobertaTokenizer::from_hf_tokenizer_json(TOY_JSON).unwrap();
        let encoding = tokenizer.encode(&["hello world"]).unwrap();
        let decoded = tokenizer.decode(&encoding.ids).unwrap();
        assert_eq!(decoded, ["hello world"]);
    }

    #[test]
    fn missing_marker_piece_is_fatal() {
        let json = r#"{"model": {"vocab": {"a": 0}, "merges": []}}"#;
        let err = RobertaTokenizer::from_hf_tokenizer_json(json).unwrap_err();
        assert!(err.to_string().contains("<s>"));
    }
}

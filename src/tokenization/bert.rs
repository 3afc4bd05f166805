use std::path::Path;

use crate::error::{LmError, Result};
use crate::tokenization::pieces::PiecesWithIds;
use crate::tokenization::pre_encoder::BertPreEncoder;
use crate::tokenization::tokenizer::{MarkerPostEncoder, MarkerPreDecoder, Tokenizer};
use crate::tokenization::vocab::Vocab;
use crate::tokenization::wordpiece::WordPiece;

/// Special pieces and normalization switches, resolved once at
/// construction.
#[derive(Debug, Clone)]
pub struct BertTokenizerConfig {
    pub lowercase: bool,
    pub strip_accents: bool,
    pub bos_piece: String,
    pub eos_piece: String,
    pub unk_piece: String,
}

impl Default for BertTokenizerConfig {
    fn default() -> Self {
        BertTokenizerConfig {
            lowercase: false,
            strip_accents: false,
            bos_piece: "[CLS]".to_string(),
            eos_piece: "[SEP]".to_string(),
            unk_piece: "[UNK]".to_string(),
        }
    }
}

/// WordPiece pipeline: BERT pre-encoder, greedy splitter, `[CLS]`/`[SEP]`
/// markers.
#[derive(Debug, Clone)]
pub struct BertTokenizer {
    pre_encoder: BertPreEncoder,
    wordpiece: WordPiece,
    post_encoder: MarkerPostEncoder,
    pre_decoder: MarkerPreDecoder,
}

impl BertTokenizer {
    pub fn new(vocab: Vocab, config: BertTokenizerConfig) -> Result<Self> {
        let post_encoder = MarkerPostEncoder::new(&vocab, &config.bos_piece, &config.eos_piece)?;
        let pre_decoder =
            MarkerPreDecoder::new([post_encoder.bos_id(), post_encoder.eos_id()]);
        Ok(BertTokenizer {
            pre_encoder: BertPreEncoder::new(config.lowercase, config.strip_accents),
            wordpiece: WordPiece::new(vocab, &config.unk_piece)?,
            post_encoder,
            pre_decoder,
        })
    }

    /// Construct from a line-oriented piece list; line order defines id
    /// assignment.
    pub fn from_files(vocab_path: &Path, config: BertTokenizerConfig) -> Result<Self> {
        Self::new(Vocab::from_file(vocab_path)?, config)
    }

    pub fn vocab(&self) -> &Vocab {
        self.wordpiece.vocab()
    }
}

impl Tokenizer for BertTokenizer {
    fn encode(&self, texts: &[&str]) -> Result<PiecesWithIds> {
        let normalized = self.pre_encoder.pre_encode(texts);

        let mut out = PiecesWithIds::default();
        for text in &normalized {
            let mut ids = Vec::new();
            let mut pieces = Vec::new();
            let mut lens = Vec::new();
            for word in text.split_whitespace() {
                let split = self.wordpiece.split_word(word);
                lens.push(split.len());
                for (piece, id) in split {
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
                Ok(WordPiece::join_pieces(pieces))
            })
            .collect()
    }
}

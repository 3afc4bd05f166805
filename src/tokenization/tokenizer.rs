use crate::error::Result;
use crate::tokenization::pieces::PiecesWithIds;
use crate::tokenization::vocab::Vocab;

/// A complete text → pieces pipeline and its inverse.
pub trait Tokenizer {
    /// Pre-encode, split, look ids up, and post-encode a batch of texts.
    fn encode(&self, texts: &[&str]) -> Result<PiecesWithIds>;

    /// Strip markers, map ids back to pieces, and join them into strings.
    fn decode(&self, ids: &[Vec<u32>]) -> Result<Vec<String>>;
}

/// Post-encoder inserting begin/end-of-sequence markers around each
/// sequence. Ids, piece strings, and length metadata stay consistent; each
/// marker counts as its own word in `lens`.
#[derive(Debug, Clone)]
pub struct MarkerPostEncoder {
    bos_piece: String,
    eos_piece: String,
    bos_id: u32,
    eos_id: u32,
}

impl MarkerPostEncoder {
    /// Resolve the marker pieces against the vocabulary; absence is fatal.
    pub fn new(vocab: &Vocab, bos_piece: &str, eos_piece: &str) -> Result<Self> {
        Ok(MarkerPostEncoder {
            bos_id: vocab.special_piece_id(bos_piece)?,
            eos_id: vocab.special_piece_id(eos_piece)?,
            bos_piece: bos_piece.to_string(),
            eos_piece: eos_piece.to_string(),
        })
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn post_encode(&self, mut pieces: PiecesWithIds) -> PiecesWithIds {
        for ids in &mut pieces.ids {
            ids.insert(0, self.bos_id);
            ids.push(self.eos_id);
        }
        for seq in &mut pieces.pieces {
            seq.insert(0, self.bos_piece.clone());
            seq.push(self.eos_piece.clone());
        }
        for lens in &mut pieces.lens {
            lens.insert(0, 1);
            lens.push(1);
        }
        pieces
    }
}

/// Pre-decoder stripping designated marker ids wherever they appear; a
/// sequence without markers passes through unchanged.
#[derive(Debug, Clone)]
pub struct MarkerPreDecoder {
    marker_ids: Vec<u32>,
}

impl MarkerPreDecoder {
    pub fn new(marker_ids: impl Into<Vec<u32>>) -> Self {
        MarkerPreDecoder {
            marker_ids: marker_ids.into(),
        }
    }

    pub fn pre_decode(&self, ids: &[Vec<u32>]) -> Vec<Vec<u32>> {
        ids.iter()
            .map(|seq| {
                seq.iter()
                    .copied()
                    .filter(|id| !self.marker_ids.contains(id))
                    .collect()
            })
            .collect()
    }
}

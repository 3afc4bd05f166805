use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{LmError, Result};

/// Bidirectional mapping between string pieces and dense integer ids.
///
/// Ids are contiguous from 0; the id of a piece is its position in the
/// construction order (or the explicit id when built from a piece → id map).
#[derive(Debug, Clone)]
pub struct Vocab {
    piece_to_id: HashMap<String, u32>,
    id_to_piece: Vec<String>,
}

impl Vocab {
    /// Build a vocabulary from pieces in id order.
    pub fn from_pieces<I>(pieces: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let id_to_piece: Vec<String> = pieces.into_iter().map(Into::into).collect();
        let mut piece_to_id = HashMap::with_capacity(id_to_piece.len());
        for (id, piece) in id_to_piece.iter().enumerate() {
            if piece_to_id.insert(piece.clone(), id as u32).is_some() {
                return Err(LmError::TokenizerData(format!(
                    "duplicate piece '{piece}' in vocabulary"
                )));
            }
        }
        Ok(Vocab {
            piece_to_id,
            id_to_piece,
        })
    }

    /// Build a vocabulary from an explicit piece → id map.
    ///
    /// The ids must be dense and contiguous from 0.
    pub fn from_id_map(map: HashMap<String, u32>) -> Result<Self> {
        let mut id_to_piece = vec![String::new(); map.len()];
        for (piece, &id) in &map {
            let slot = id_to_piece.get_mut(id as usize).ok_or_else(|| {
                LmError::TokenizerData(format!(
                    "piece '{piece}' has id {id}, outside the dense range 0..{}",
                    map.len()
                ))
            })?;
            if !slot.is_empty() {
                return Err(LmError::TokenizerData(format!(
                    "pieces '{slot}' and '{piece}' share id {id}"
                )));
            }
            *slot = piece.clone();
        }
        Ok(Vocab {
            piece_to_id: map,
            id_to_piece,
        })
    }

    /// Read a line-oriented vocabulary file; line order defines id
    /// assignment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut pieces = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let piece = line.trim_end_matches(['\r', '\n']);
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
        }
        Self::from_pieces(pieces)
    }

    pub fn piece_id(&self, piece: &str) -> Option<u32> {
        self.piece_to_id.get(piece).copied()
    }

    pub fn id_to_piece(&self, id: u32) -> Option<&str> {
        self.id_to_piece.get(id as usize).map(String::as_str)
    }

    /// Look up a piece that must be present, e.g. a special marker
    /// requested at pipeline construction.
    pub fn special_piece_id(&self, piece: &str) -> Result<u32> {
        self.piece_id(piece).ok_or_else(|| LmError::MissingPiece {
            piece: piece.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.id_to_piece.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_piece.is_empty()
    }
}

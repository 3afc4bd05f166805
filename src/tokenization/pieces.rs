use tch::{Kind, Tensor};

use crate::models::attention::AttentionMask;

/// Result of tokenizing a batch of texts.
///
/// `ids` and `pieces` are parallel per sequence; `lens` records how many
/// pieces each input word produced (inserted markers count as their own
/// word). For every batch element `i`:
/// `ids[i].len() == pieces[i].len() == lens[i].iter().sum()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PiecesWithIds {
    pub ids: Vec<Vec<u32>>,
    pub pieces: Vec<Vec<String>>,
    pub lens: Vec<Vec<usize>>,
}

impl PiecesWithIds {
    /// Right-pad the batch into a `[batch, max_len]` id tensor.
    pub fn padded_tensor(&self, padding_id: u32) -> Tensor {
        let max_len = self.ids.iter().map(Vec::len).max().unwrap_or(0);
        if self.ids.is_empty() || max_len == 0 {
            return Tensor::zeros(&[self.ids.len() as i64, 0], (Kind::Int64, tch::Device::Cpu));
        }

        let rows: Vec<Tensor> = self
            .ids
            .iter()
            .map(|seq| {
                let mut row: Vec<i64> = seq.iter().map(|&id| id as i64).collect();
                row.resize(max_len, padding_id as i64);
                Tensor::from_slice(&row)
            })
            .collect();
        Tensor::stack(&rows, 0)
    }

    /// Boolean mask over the padded tensor: `true` exactly where a real
    /// piece exists.
    pub fn attention_mask(&self) -> AttentionMask {
        let max_len = self.ids.iter().map(Vec::len).max().unwrap_or(0);
        if self.ids.is_empty() || max_len == 0 {
            let empty = Tensor::zeros(&[self.ids.len() as i64, 0], (Kind::Bool, tch::Device::Cpu));
            return AttentionMask::from_bool(empty);
        }

        let rows: Vec<Tensor> = self
            .ids
            .iter()
            .map(|seq| {
                let mut row = vec![true; seq.len()];
                row.resize(max_len, false);
                Tensor::from_slice(&row)
            })
            .collect();
        AttentionMask::from_bool(Tensor::stack(&rows, 0))
    }
}

use tch::{Kind, Tensor};

use crate::error::Result;
use crate::hub::load::Params;
use crate::models::attention::AttentionMask;
use crate::models::config::{EmbeddingConfig, NormKind};
use crate::models::layer::Norm;

/// Token + position + optional segment embeddings, summed, optionally
/// normalized and dropout-regularized.
#[derive(Debug)]
pub struct TransformerEmbeddings {
    piece_embeddings: Tensor,
    position_embeddings: Option<Tensor>,
    type_embeddings: Option<Tensor>,
    norm: Option<Norm>,
    position_offset: i64,
    dropout: f64,
}

impl TransformerEmbeddings {
    pub fn new(config: &EmbeddingConfig, params: &mut Params, prefix: &str) -> Result<Self> {
        let width = config.hidden_width;
        let position_embeddings = match config.n_positions {
            Some(n_positions) if config.sinusoidal => {
                Some(sinusoidal_table(n_positions, width).to_device(params.device()))
            }
            Some(n_positions) => Some(params.take(
                &format!("{prefix}.position_embeddings.weight"),
                &[n_positions, width],
            )?),
            None => None,
        };
        Ok(TransformerEmbeddings {
            piece_embeddings: params.take(
                &format!("{prefix}.piece_embeddings.weight"),
                &[config.vocab_size, width],
            )?,
            position_embeddings,
            type_embeddings: match config.n_types {
                Some(n_types) => Some(params.take(
                    &format!("{prefix}.type_embeddings.weight"),
                    &[n_types, width],
                )?),
                None => None,
            },
            norm: if config.normalize {
                Some(Norm::new(
                    params,
                    &format!("{prefix}.norm"),
                    width,
                    NormKind::LayerNorm,
                    config.layer_norm_eps,
                )?)
            } else {
                None
            },
            position_offset: config.position_offset,
            dropout: config.dropout,
        })
    }

    /// Embed `ids` (`[batch, new_len]`). `mask` covers the whole sequence
    /// seen so far (cache included), so learned positions number real
    /// pieces only; a left-padded batch gets the same positions as an
    /// unpadded one.
    pub fn forward(
        &self,
        ids: &Tensor,
        type_ids: Option<&Tensor>,
        mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor> {
        let size = ids.size();
        let (batch, new_len) = (size[0], size[1]);
        let width = self.piece_embeddings.size()[1];

        let mut embedded = self
            .piece_embeddings
            .index_select(0, &ids.reshape([-1]))
            .view([batch, new_len, width]);

        if let Some(table) = &self.position_embeddings {
            // Positions come from a cumulative count of non-padding
            // pieces; the raw column index would be wrong under left
            // padding.
            let total = mask.key_len();
            let positions = (mask.bool_mask().to_kind(Kind::Int64).cumsum(1, Kind::Int64) - 1)
                .clamp_min(0i64)
                + self.position_offset;
            let positions = positions.narrow(1, total - new_len, new_len);
            let position_embedded = table
                .index_select(0, &positions.reshape([-1]))
                .view([batch, new_len, width]);
            embedded = embedded + position_embedded;
        }

        if let Some(table) = &self.type_embeddings {
            let type_ids = match type_ids {
                Some(type_ids) => type_ids.shallow_clone(),
                None => Tensor::zeros(&[batch, new_len], (Kind::Int64, ids.device())),
            };
            let type_embedded = table
                .index_select(0, &type_ids.reshape([-1]))
                .view([batch, new_len, width]);
            embedded = embedded + type_embedded;
        }

        if let Some(norm) = &self.norm {
            embedded = norm.forward(&embedded);
        }
        Ok(embedded.dropout(self.dropout, train))
    }
}

/// Fixed sinusoidal position table: even columns sine, odd columns cosine,
/// frequencies geometric in the column pair index.
fn sinusoidal_table(n_positions: i64, width: i64) -> Tensor {
    let half = width / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| (1.0 / 10_000f64.powf(2.0 * i as f64 / width as f64)) as f32)
        .collect();
    let inv_freq = Tensor::from_slice(&inv_freq);
    let positions = Tensor::arange(n_positions, (Kind::Float, tch::Device::Cpu));
    let angles = positions.unsqueeze(1) * inv_freq.unsqueeze(0);
    Tensor::stack(&[angles.sin(), angles.cos()], 2).view([n_positions, width])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ModelConfig;
    use tch::Device;

    fn tiny_config() -> EmbeddingConfig {
        let mut config = ModelConfig::bert().embedding;
        config.vocab_size = 16;
        config.hidden_width = 8;
        config.n_positions = Some(12);
        config.n_types = Some(2);
        config.dropout = 0.0;
        config
    }

    #[test]
    fn output_shape_is_batch_by_len_by_width() {
        let mut params = Params::random(Device::Cpu);
        let embeddings = TransformerEmbeddings::new(&tiny_config(), &mut params, "embeddings").unwrap();
        let ids = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6]).view([2, 3]);
        let mask = AttentionMask::full(2, 3, Device::Cpu);
        let out = embeddings.forward(&ids, None, &mask, false).unwrap();
        assert_eq!(out.size(), &[2, 3, 8]);
    }

    #[test]
    fn left_padding_does_not_shift_positions() {
        tch::manual_seed(7);
        let mut params = Params::random(Device::Cpu);
        let embeddings = TransformerEmbeddings::new(&tiny_config(), &mut params, "embeddings").unwrap();

        let unpadded = Tensor::from_slice(&[5i64, 6, 7]).view([1, 3]);
        let full = AttentionMask::full(1, 3, Device::Cpu);
        let reference = embeddings.forward(&unpadded, None, &full, false).unwrap();

        // Same pieces, left-padded with the pad id 0.
        let padded = Tensor::from_slice(&[0i64, 0, 5, 6, 7]).view([1, 5]);
        let mask = AttentionMask::from_input_ids(&padded, 0);
        let out = embeddings.forward(&padded, None, &mask, false).unwrap();

        let real = out.narrow(1, 2, 3);
        assert!(real.allclose(&reference, 1e-5, 1e-6, false));
    }

    #[test]
    fn sinusoidal_table_interleaves_sin_and_cos() {
        let table = sinusoidal_table(4, 6);
        assert_eq!(table.size(), &[4, 6]);
        // Position 0: sin(0) = 0 on even columns, cos(0) = 1 on odd.
        assert!(table.double_value(&[0, 0]).abs() < 1e-6);
        assert!((table.double_value(&[0, 1]) - 1.0).abs() < 1e-6);
        assert!((table.double_value(&[1, 0]) - 1f64.sin()).abs() < 1e-5);
    }
}

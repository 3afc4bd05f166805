use log::debug;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::hub::load::Params;
use crate::models::attention::AttentionMask;
use crate::models::config::ModelConfig;
use crate::models::embeddings::TransformerEmbeddings;
use crate::models::layer::TransformerLayer;

/// Per-layer hidden states plus the embedding output they grew from.
#[derive(Debug)]
pub struct EncoderOutput {
    pub embedding_output: Tensor,
    pub layer_outputs: Vec<Tensor>,
}

impl EncoderOutput {
    pub fn last_hidden_state(&self) -> &Tensor {
        self.layer_outputs.last().unwrap_or(&self.embedding_output)
    }
}

/// Bidirectional transformer encoder (BERT, RoBERTa).
#[derive(Debug)]
pub struct EncoderModel {
    config: ModelConfig,
    embeddings: TransformerEmbeddings,
    layers: Vec<TransformerLayer>,
}

impl EncoderModel {
    pub fn new(config: ModelConfig, params: &mut Params) -> Result<Self> {
        let embeddings = TransformerEmbeddings::new(&config.embedding, params, "embeddings")?;
        let layers = (0..config.layer.n_layers)
            .map(|i| TransformerLayer::new(&config, params, &format!("layers.{i}")))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "built {:?} encoder: {} layers, width {}",
            config.family, config.layer.n_layers, config.layer.hidden_width
        );
        Ok(EncoderModel {
            config,
            embeddings,
            layers,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Encode a `[batch, seq_len]` id tensor. Without an explicit mask,
    /// one is derived by comparing ids against the configured padding id.
    pub fn forward(
        &self,
        ids: &Tensor,
        mask: Option<AttentionMask>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput> {
        let size = ids.size();
        let (batch, seq_len) = (size[0], size[1]);

        let mask = match mask {
            Some(mask) => {
                if mask.batch_size() != batch || mask.key_len() != seq_len {
                    return Err(LmError::config(format!(
                        "attention mask [{}, {}] does not match input [{batch}, {seq_len}]",
                        mask.batch_size(),
                        mask.key_len()
                    )));
                }
                mask
            }
            None => match self.config.embedding.padding_id {
                Some(padding_id) => AttentionMask::from_input_ids(ids, padding_id),
                None => AttentionMask::full(batch, seq_len, ids.device()),
            },
        };

        let embedding_output = self.embeddings.forward(ids, type_ids, &mask, train)?;
        let mut layer_outputs = Vec::with_capacity(self.layers.len());
        let mut hidden = embedding_output.shallow_clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask, false, None, train)?;
            layer_outputs.push(hidden.shallow_clone());
        }

        Ok(EncoderOutput {
            embedding_output,
            layer_outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig::bert();
        config.embedding.vocab_size = 32;
        config.embedding.hidden_width = 16;
        config.embedding.n_positions = Some(20);
        config.embedding.dropout = 0.0;
        config.layer.n_layers = 2;
        config.layer.hidden_width = 16;
        config.layer.intermediate_width = 32;
        config.layer.dropout = 0.0;
        config.attention.n_query_heads = 4;
        config.attention.n_kv_heads = 4;
        config
    }

    #[test]
    fn forward_returns_all_layer_states() {
        tch::manual_seed(11);
        let mut params = Params::random(Device::Cpu);
        let encoder = EncoderModel::new(tiny_config(), &mut params).unwrap();
        let ids = Tensor::from_slice(&[3i64, 4, 5, 6, 0, 0]).view([1, 6]);
        let out = encoder.forward(&ids, None, None, false).unwrap();
        assert_eq!(out.layer_outputs.len(), 2);
        assert_eq!(out.last_hidden_state().size(), &[1, 6, 16]);
    }

    #[test]
    fn mismatched_mask_is_rejected_before_compute() {
        tch::manual_seed(11);
        let mut params = Params::random(Device::Cpu);
        let encoder = EncoderModel::new(tiny_config(), &mut params).unwrap();
        let ids = Tensor::from_slice(&[3i64, 4, 5]).view([1, 3]);
        let mask = AttentionMask::full(1, 5, Device::Cpu);
        assert!(encoder.forward(&ids, Some(mask), None, false).is_err());
    }

    #[test]
    fn padding_positions_do_not_change_real_token_states() {
        tch::manual_seed(3);
        let mut params = Params::random(Device::Cpu);
        let encoder = EncoderModel::new(tiny_config(), &mut params).unwrap();

        let ids = Tensor::from_slice(&[7i64, 8, 9]).view([1, 3]);
        let reference = encoder.forward(&ids, None, None, false).unwrap();

        let padded = Tensor::from_slice(&[7i64, 8, 9, 0, 0]).view([1, 5]);
        let out = encoder.forward(&padded, None, None, false).unwrap();

        let real = out.last_hidden_state().narrow(1, 0, 3);
        assert!(real.allclose(reference.last_hidden_state(), 1e-4, 1e-5, false));
    }

    #[test]
    fn type_ids_change_the_output() {
        tch::manual_seed(5);
        let mut params = Params::random(Device::Cpu);
        let encoder = EncoderModel::new(tiny_config(), &mut params).unwrap();
        let ids = Tensor::from_slice(&[3i64, 4]).view([1, 2]);
        let types = Tensor::ones(&[1, 2], (Kind::Int64, Device::Cpu));
        let plain = encoder.forward(&ids, None, None, false).unwrap();
        let typed = encoder.forward(&ids, None, Some(&types), false).unwrap();
        assert!(!plain
            .last_hidden_state()
            .allclose(typed.last_hidden_state(), 1e-4, 1e-5, false));
    }
}

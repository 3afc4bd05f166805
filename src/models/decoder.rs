use log::debug;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::hub::load::Params;
use crate::models::attention::AttentionMask;
use crate::models::config::ModelConfig;
use crate::models::embeddings::TransformerEmbeddings;
use crate::models::kv_cache::KeyValueCache;
use crate::models::layer::{Norm, TransformerLayer};

#[derive(Debug)]
pub struct DecoderOutput {
    pub embedding_output: Tensor,
    /// Hidden states per layer; the final entry carries the output
    /// normalization.
    pub layer_outputs: Vec<Tensor>,
}

impl DecoderOutput {
    pub fn last_hidden_state(&self) -> &Tensor {
        self.layer_outputs.last().unwrap_or(&self.embedding_output)
    }
}

/// Causal transformer decoder (LLaMA, GPT-NeoX).
///
/// With a cache, each forward call receives only the pieces not yet
/// represented in it; cached positions are never reprocessed.
#[derive(Debug)]
pub struct DecoderModel {
    config: ModelConfig,
    embeddings: TransformerEmbeddings,
    layers: Vec<TransformerLayer>,
    output_norm: Norm,
}

impl DecoderModel {
    pub fn new(config: ModelConfig, params: &mut Params) -> Result<Self> {
        let embeddings = TransformerEmbeddings::new(&config.embedding, params, "embeddings")?;
        let layers = (0..config.layer.n_layers)
            .map(|i| TransformerLayer::new(&config, params, &format!("layers.{i}")))
            .collect::<Result<Vec<_>>>()?;
        let output_norm = Norm::new(
            params,
            "output_norm",
            config.layer.hidden_width,
            config.layer.norm,
            config.layer.norm_eps,
        )?;
        debug!(
            "built {:?} decoder: {} layers, width {}",
            config.family, config.layer.n_layers, config.layer.hidden_width
        );
        Ok(DecoderModel {
            config,
            embeddings,
            layers,
            output_norm,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn new_cache(&self) -> KeyValueCache {
        KeyValueCache::new(self.layers.len())
    }

    /// Cache preallocated for a known maximum decode length.
    pub fn new_cache_with_capacity(&self, capacity: i64) -> KeyValueCache {
        KeyValueCache::with_capacity(self.layers.len(), capacity)
    }

    /// Run the decoder over the new ids. `mask`, when given, must cover
    /// the cached prefix plus the new pieces; geometry mismatches fail
    /// before any computation.
    pub fn forward(
        &self,
        ids: &Tensor,
        mask: Option<AttentionMask>,
        mut cache: Option<&mut KeyValueCache>,
        train: bool,
    ) -> Result<DecoderOutput> {
        let size = ids.size();
        let (batch, new_len) = (size[0], size[1]);

        let past_len = match &cache {
            Some(cache) => {
                let head_dim = self.config.attention.head_dim(self.config.layer.hidden_width);
                cache.validate(
                    self.layers.len(),
                    batch,
                    self.config.attention.n_kv_heads,
                    head_dim,
                )?;
                cache.seen_len()
            }
            None => 0,
        };

        let total_len = past_len + new_len;
        let mask = match mask {
            Some(mask) => {
                if mask.batch_size() != batch || mask.key_len() != total_len {
                    return Err(LmError::config(format!(
                        "attention mask [{}, {}] does not cover cache + input [{batch}, {total_len}]",
                        mask.batch_size(),
                        mask.key_len()
                    )));
                }
                mask
            }
            None => AttentionMask::full(batch, total_len, ids.device()),
        };

        let embedding_output = self.embeddings.forward(ids, None, &mask, train)?;
        let mut layer_outputs = Vec::with_capacity(self.layers.len());
        let mut hidden = embedding_output.shallow_clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_mut().map(|cache| (&mut **cache, i));
            hidden = layer.forward(&hidden, &mask, true, layer_cache, train)?;
            layer_outputs.push(hidden.shallow_clone());
        }

        if let Some(last) = layer_outputs.last_mut() {
            *last = self.output_norm.forward(last);
        }

        Ok(DecoderOutput {
            embedding_output,
            layer_outputs,
        })
    }
}

use tch::Tensor;

use crate::error::Result;
use crate::hub::load::Params;
use crate::models::attention::AttentionMask;
use crate::models::config::ModelConfig;
use crate::models::decoder::{DecoderModel, DecoderOutput};
use crate::models::kv_cache::KeyValueCache;
use crate::models::layer::Linear;

#[derive(Debug)]
pub struct CausalLMOutput {
    /// `[batch, seq_len, vocab]` without a cache; `[batch, 1, vocab]`
    /// (last position only) with one.
    pub logits: Tensor,
    pub decoder_output: DecoderOutput,
}

/// A causal decoder with the output-embedding projection to vocabulary
/// logits.
#[derive(Debug)]
pub struct CausalLM {
    decoder: DecoderModel,
    output_embeddings: Linear,
}

impl CausalLM {
    pub fn new(config: ModelConfig, params: &mut Params) -> Result<Self> {
        let output_embeddings = Linear::new(
            params,
            "output_embeddings",
            config.embedding.vocab_size,
            config.layer.hidden_width,
            false,
        )?;
        Ok(CausalLM {
            decoder: DecoderModel::new(config, params)?,
            output_embeddings,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        self.decoder.config()
    }

    pub fn new_cache(&self) -> KeyValueCache {
        self.decoder.new_cache()
    }

    pub fn new_cache_with_capacity(&self, capacity: i64) -> KeyValueCache {
        self.decoder.new_cache_with_capacity(capacity)
    }

    /// Forward pass producing logits. When a cache is supplied only the
    /// last position is projected: during incremental decoding only that
    /// position's continuation is ever consumed.
    pub fn forward(
        &self,
        ids: &Tensor,
        mask: Option<AttentionMask>,
        cache: Option<&mut KeyValueCache>,
        train: bool,
    ) -> Result<CausalLMOutput> {
        let incremental = cache.is_some();
        let decoder_output = self.decoder.forward(ids, mask, cache, train)?;

        let hidden = decoder_output.last_hidden_state();
        let hidden = if incremental {
            let seq_len = hidden.size()[1];
            hidden.narrow(1, seq_len - 1, 1)
        } else {
            hidden.shallow_clone()
        };
        let logits = self.output_embeddings.forward(&hidden);

        Ok(CausalLMOutput {
            logits,
            decoder_output,
        })
    }
}

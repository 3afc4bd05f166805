use tch::{Kind, Tensor};

use crate::error::{LmError, Result};
use crate::hub::load::Params;
use crate::models::config::{AttentionConfig, LayerConfig, RotaryConfig};
use crate::models::kv_cache::KeyValueCache;
use crate::models::layer::Linear;

/// Boolean mask over key positions: `true` where a real piece exists.
///
/// Shaped `[batch, key_len]`; during incremental decoding the caller
/// extends it so `key_len` always covers cache plus new pieces.
#[derive(Debug)]
pub struct AttentionMask {
    mask: Tensor,
}

impl AttentionMask {
    /// Wrap a Bool tensor already shaped `[batch, key_len]`.
    pub fn from_bool(mask: Tensor) -> Self {
        AttentionMask { mask }
    }

    /// Validate and convert an arbitrary 0/1 mask tensor.
    pub fn new(mask: Tensor) -> Result<Self> {
        if mask.dim() != 2 {
            return Err(LmError::config(format!(
                "attention mask must be [batch, seq_len], got {:?}",
                mask.size()
            )));
        }
        let mask = if mask.kind() == Kind::Bool {
            mask
        } else {
            mask.ne(0i64)
        };
        Ok(AttentionMask { mask })
    }

    /// Derive a mask from input ids by comparing against the padding id.
    pub fn from_input_ids(ids: &Tensor, padding_id: i64) -> Self {
        AttentionMask {
            mask: ids.ne(padding_id),
        }
    }

    /// All-valid mask for unpadded input.
    pub fn full(batch: i64, seq_len: i64, device: tch::Device) -> Self {
        AttentionMask {
            mask: Tensor::ones(&[batch, seq_len], (Kind::Bool, device)),
        }
    }

    pub fn bool_mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn batch_size(&self) -> i64 {
        self.mask.size()[0]
    }

    pub fn key_len(&self) -> i64 {
        self.mask.size()[1]
    }

    /// Concatenate a mask for newly decoded pieces onto this one.
    pub fn extend(&self, added: &AttentionMask) -> AttentionMask {
        AttentionMask {
            mask: Tensor::cat(&[&self.mask, &added.mask], 1),
        }
    }

    /// Mask out invalid key positions in a `[batch, heads, q_len, k_len]`
    /// score tensor.
    pub fn apply_to_scores(&self, scores: &Tensor) -> Tensor {
        let (batch, key_len) = (self.batch_size(), self.key_len());
        let blocked = self.mask.logical_not().view([batch, 1, 1, key_len]);
        scores.masked_fill(&blocked, f64::NEG_INFINITY)
    }
}

/// Rotary position embeddings applied to queries and keys inside
/// attention. Only the first `rotary_dim` elements of each head rotate;
/// the remainder passes through (GPT-NeoX rotates a quarter).
#[derive(Debug)]
pub struct RotaryEmbeddings {
    rotary_dim: i64,
    base: f64,
}

impl RotaryEmbeddings {
    pub fn new(head_dim: i64, config: &RotaryConfig) -> Self {
        let rotary_dim = ((head_dim as f64 * config.fraction) as i64) & !1;
        RotaryEmbeddings {
            rotary_dim,
            base: config.base,
        }
    }

    /// Rotate `x` (`[batch, heads, seq, head_dim]`) for absolute positions
    /// `start_pos..start_pos + seq`.
    pub fn apply(&self, x: &Tensor, start_pos: i64) -> Tensor {
        let size = x.size();
        let (seq_len, head_dim) = (size[2], size[3]);
        let device = x.device();
        let half = self.rotary_dim / 2;

        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / self.base.powf(2.0 * i as f64 / self.rotary_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq).to_device(device);
        let positions = Tensor::arange_start(start_pos, start_pos + seq_len, (Kind::Float, device));
        let freqs = positions.unsqueeze(1) * inv_freq.unsqueeze(0);
        let cos = freqs.cos().view([1, 1, seq_len, half]);
        let sin = freqs.sin().view([1, 1, seq_len, half]);

        let x_rot = x.narrow(3, 0, self.rotary_dim);
        let x1 = x_rot.narrow(3, 0, half);
        let x2 = x_rot.narrow(3, half, half);
        let rotated = Tensor::cat(&[&x1 * &cos - &x2 * &sin, &x2 * &cos + &x1 * &sin], 3);

        if self.rotary_dim == head_dim {
            rotated
        } else {
            let passthrough = x.narrow(3, self.rotary_dim, head_dim - self.rotary_dim);
            Tensor::cat(&[rotated, passthrough], 3)
        }
    }
}

/// Multi-head self-attention with optional rotary embeddings, grouped
/// query attention, and key-value caching.
#[derive(Debug)]
pub struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    rotary: Option<RotaryEmbeddings>,
    n_query_heads: i64,
    n_kv_heads: i64,
    head_dim: i64,
    dropout: f64,
}

impl SelfAttention {
    pub fn new(
        attention: &AttentionConfig,
        layer: &LayerConfig,
        params: &mut Params,
        prefix: &str,
    ) -> Result<Self> {
        let width = layer.hidden_width;
        let head_dim = attention.head_dim(width);
        let q_width = attention.n_query_heads * head_dim;
        let kv_width = attention.n_kv_heads * head_dim;
        let bias = attention.use_bias;
        Ok(SelfAttention {
            query: Linear::new(params, &format!("{prefix}.query"), q_width, width, bias)?,
            key: Linear::new(params, &format!("{prefix}.key"), kv_width, width, bias)?,
            value: Linear::new(params, &format!("{prefix}.value"), kv_width, width, bias)?,
            output: Linear::new(params, &format!("{prefix}.output"), width, q_width, bias)?,
            rotary: attention
                .rotary
                .as_ref()
                .map(|rc| RotaryEmbeddings::new(head_dim, rc)),
            n_query_heads: attention.n_query_heads,
            n_kv_heads: attention.n_kv_heads,
            head_dim,
            dropout: layer.dropout,
        })
    }

    /// One attention pass. `mask` covers cache plus new pieces. With a
    /// cache, the new keys/values are appended first and attention runs
    /// over the full cached length.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &AttentionMask,
        causal: bool,
        mut cache: Option<(&mut KeyValueCache, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        let size = x.size();
        let (batch, q_len) = (size[0], size[1]);

        let queries = self
            .query
            .forward(x)
            .view([batch, q_len, self.n_query_heads, self.head_dim])
            .transpose(1, 2);
        let keys = self
            .key
            .forward(x)
            .view([batch, q_len, self.n_kv_heads, self.head_dim])
            .transpose(1, 2);
        let values = self
            .value
            .forward(x)
            .view([batch, q_len, self.n_kv_heads, self.head_dim])
            .transpose(1, 2);

        let past_len = match &cache {
            Some((cache, layer_idx)) => cache.past_len(*layer_idx),
            None => 0,
        };

        // Rotation happens before caching so cached keys stay rotated.
        let (queries, keys) = match &self.rotary {
            Some(rotary) => (
                rotary.apply(&queries, past_len),
                rotary.apply(&keys, past_len),
            ),
            None => (queries, keys),
        };

        let (keys, values) = match cache.as_mut() {
            Some((cache, layer_idx)) => cache.append(*layer_idx, &keys, &values)?,
            None => (keys, values),
        };

        let keys = repeat_kv(&keys, self.n_query_heads / self.n_kv_heads);
        let values = repeat_kv(&values, self.n_query_heads / self.n_kv_heads);

        let key_len = keys.size()[2];
        let mut scores = queries.matmul(&keys.transpose(-2, -1)) / (self.head_dim as f64).sqrt();
        if causal {
            let allowed = Tensor::ones(&[q_len, key_len], (Kind::Bool, x.device())).tril(past_len);
            scores = scores.masked_fill(
                &allowed.logical_not().view([1, 1, q_len, key_len]),
                f64::NEG_INFINITY,
            );
        }
        let scores = mask.apply_to_scores(&scores);

        let probs = scores.softmax(-1, Kind::Float).dropout(self.dropout, train);
        let context = probs
            .matmul(&values)
            .transpose(1, 2)
            .contiguous()
            .view([batch, q_len, self.n_query_heads * self.head_dim]);

        Ok(self.output.forward(&context))
    }
}

/// Repeat key/value heads for grouped query attention.
fn repeat_kv(x: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return x.shallow_clone();
    }
    let size = x.size();
    let (batch, n_kv_heads, seq_len, head_dim) = (size[0], size[1], size[2], size[3]);
    x.unsqueeze(2)
        .expand([batch, n_kv_heads, n_rep, seq_len, head_dim], true)
        .reshape([batch, n_kv_heads * n_rep, seq_len, head_dim])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn mask_rejects_wrong_rank() {
        let mask = Tensor::ones(&[2, 3, 4], (Kind::Bool, Device::Cpu));
        assert!(AttentionMask::new(mask).is_err());
    }

    #[test]
    fn mask_derived_from_padding_id() {
        let ids = Tensor::from_slice(&[5i64, 6, 0, 0]).view([1, 4]);
        let mask = AttentionMask::from_input_ids(&ids, 0);
        assert_eq!(mask.key_len(), 4);
        assert_eq!(mask.bool_mask().int64_value(&[0, 1]), 1);
        assert_eq!(mask.bool_mask().int64_value(&[0, 2]), 0);
    }

    #[test]
    fn extend_appends_new_positions() {
        let ids = Tensor::from_slice(&[5i64, 0]).view([1, 2]);
        let mask = AttentionMask::from_input_ids(&ids, 0);
        let grown = mask.extend(&AttentionMask::full(1, 1, Device::Cpu));
        assert_eq!(grown.key_len(), 3);
        assert_eq!(grown.bool_mask().int64_value(&[0, 1]), 0);
        assert_eq!(grown.bool_mask().int64_value(&[0, 2]), 1);
    }

    #[test]
    fn masked_scores_softmax_to_zero_probability() {
        let ids = Tensor::from_slice(&[5i64, 6, 0]).view([1, 3]);
        let mask = AttentionMask::from_input_ids(&ids, 0);
        let scores = Tensor::zeros(&[1, 1, 1, 3], (Kind::Float, Device::Cpu));
        let probs = mask.apply_to_scores(&scores).softmax(-1, Kind::Float);
        let last: f64 = probs.double_value(&[0, 0, 0, 2]);
        assert!(last.abs() < 1e-6);
    }

    #[test]
    fn rotary_leaves_position_zero_unrotated() {
        let rotary = RotaryEmbeddings::new(8, &RotaryConfig::default());
        let x = Tensor::randn(&[2, 3, 4, 8], (Kind::Float, Device::Cpu));
        let rotated = rotary.apply(&x, 0);
        assert_eq!(rotated.size(), x.size());
        // Position 0 rotates by angle 0, so the first sequence slot is
        // unchanged.
        let first = rotated.narrow(2, 0, 1);
        let orig = x.narrow(2, 0, 1);
        assert!(first.allclose(&orig, 1e-5, 1e-6, false));
    }

    #[test]
    fn partial_rotation_leaves_tail_untouched() {
        let rotary = RotaryEmbeddings::new(
            8,
            &RotaryConfig {
                fraction: 0.5,
                base: 10_000.0,
            },
        );
        let x = Tensor::randn(&[1, 1, 5, 8], (Kind::Float, Device::Cpu));
        let rotated = rotary.apply(&x, 3);
        let tail = rotated.narrow(3, 4, 4);
        let orig = x.narrow(3, 4, 4);
        assert!(tail.allclose(&orig, 1e-6, 1e-7, false));
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let x = Tensor::randn(&[2, 2, 3, 4], (Kind::Float, Device::Cpu));
        let repeated = repeat_kv(&x, 3);
        assert_eq!(repeated.size(), &[2, 6, 3, 4]);
        let head0 = repeated.narrow(1, 0, 1);
        let head1 = repeated.narrow(1, 1, 1);
        assert!(head0.allclose(&head1, 1e-6, 1e-7, false));
    }
}

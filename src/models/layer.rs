use tch::Tensor;

use crate::error::Result;
use crate::hub::load::Params;
use crate::models::attention::{AttentionMask, SelfAttention};
use crate::models::config::{Activation, LayerConfig, ModelConfig, NormKind, NormPlacement};
use crate::models::kv_cache::KeyValueCache;

/// Linear projection storing its weight in checkpoint layout
/// `[out_width, in_width]`.
#[derive(Debug)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(
        params: &mut Params,
        prefix: &str,
        out_width: i64,
        in_width: i64,
        bias: bool,
    ) -> Result<Self> {
        Ok(Linear {
            weight: params.take(&format!("{prefix}.weight"), &[out_width, in_width])?,
            bias: if bias {
                Some(params.take(&format!("{prefix}.bias"), &[out_width])?)
            } else {
                None
            },
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mut out = x.matmul(&self.weight.transpose(0, 1));
        if let Some(bias) = &self.bias {
            out = out + bias;
        }
        out
    }
}

/// Layer normalization in either the biased LayerNorm or the RMSNorm
/// formulation, selected by configuration.
#[derive(Debug)]
pub struct Norm {
    weight: Tensor,
    bias: Option<Tensor>,
    kind: NormKind,
    width: i64,
    eps: f64,
}

impl Norm {
    pub fn new(
        params: &mut Params,
        prefix: &str,
        width: i64,
        kind: NormKind,
        eps: f64,
    ) -> Result<Self> {
        Ok(Norm {
            weight: params.take(&format!("{prefix}.weight"), &[width])?,
            bias: match kind {
                NormKind::LayerNorm => Some(params.take(&format!("{prefix}.bias"), &[width])?),
                NormKind::RmsNorm => None,
            },
            kind,
            width,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self.kind {
            NormKind::LayerNorm => x.layer_norm(
                &[self.width],
                Some(&self.weight),
                self.bias.as_ref(),
                self.eps,
                false,
            ),
            NormKind::RmsNorm => {
                let variance = (x * x).mean_dim(Some([-1i64].as_slice()), true, x.kind());
                x * (variance + self.eps).rsqrt() * &self.weight
            }
        }
    }
}

/// Position-wise feed-forward sublayer, plain (`down(act(up(x)))`) or
/// gated (`down(act(gate(x)) * up(x))`).
#[derive(Debug)]
pub struct FeedForward {
    up: Linear,
    gate: Option<Linear>,
    down: Linear,
    activation: Activation,
    dropout: f64,
}

impl FeedForward {
    pub fn new(layer: &LayerConfig, params: &mut Params, prefix: &str) -> Result<Self> {
        let (width, inter) = (layer.hidden_width, layer.intermediate_width);
        Ok(FeedForward {
            up: Linear::new(params, &format!("{prefix}.up"), inter, width, layer.use_bias)?,
            gate: if layer.gated_ffn {
                Some(Linear::new(
                    params,
                    &format!("{prefix}.gate"),
                    inter,
                    width,
                    layer.use_bias,
                )?)
            } else {
                None
            },
            down: Linear::new(params, &format!("{prefix}.down"), width, inter, layer.use_bias)?,
            activation: layer.activation,
            dropout: layer.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let up = self.up.forward(x);
        let hidden = match &self.gate {
            Some(gate) => activate(&gate.forward(x), self.activation) * up,
            None => activate(&up, self.activation),
        };
        self.down.forward(&hidden.dropout(self.dropout, train))
    }
}

fn activate(x: &Tensor, activation: Activation) -> Tensor {
    match activation {
        Activation::Gelu => x.gelu("none"),
        Activation::Silu => x.silu(),
    }
}

/// One transformer layer: self-attention plus feed-forward, with residual
/// connections and configuration-selected normalization placement. All
/// architecture families share this type.
#[derive(Debug)]
pub struct TransformerLayer {
    attention: SelfAttention,
    attention_norm: Norm,
    ffn: FeedForward,
    ffn_norm: Norm,
    placement: NormPlacement,
    dropout: f64,
}

impl TransformerLayer {
    pub fn new(config: &ModelConfig, params: &mut Params, prefix: &str) -> Result<Self> {
        let layer = &config.layer;
        Ok(TransformerLayer {
            attention: SelfAttention::new(
                &config.attention,
                layer,
                params,
                &format!("{prefix}.attention"),
            )?,
            attention_norm: Norm::new(
                params,
                &format!("{prefix}.attention_norm"),
                layer.hidden_width,
                layer.norm,
                layer.norm_eps,
            )?,
            ffn: FeedForward::new(layer, params, &format!("{prefix}.ffn"))?,
            ffn_norm: Norm::new(
                params,
                &format!("{prefix}.ffn_norm"),
                layer.hidden_width,
                layer.norm,
                layer.norm_eps,
            )?,
            placement: layer.norm_placement,
            dropout: layer.dropout,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: &AttentionMask,
        causal: bool,
        cache: Option<(&mut KeyValueCache, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        match self.placement {
            NormPlacement::Pre => {
                let attn_out = self
                    .attention
                    .forward(&self.attention_norm.forward(x), mask, causal, cache, train)?
                    .dropout(self.dropout, train);
                let x = x + attn_out;
                let ffn_out = self.ffn.forward(&self.ffn_norm.forward(&x), train);
                Ok(x + ffn_out.dropout(self.dropout, train))
            }
            NormPlacement::Post => {
                let attn_out = self
                    .attention
                    .forward(x, mask, causal, cache, train)?
                    .dropout(self.dropout, train);
                let x = self.attention_norm.forward(&(x + attn_out));
                let ffn_out = self.ffn.forward(&x, train).dropout(self.dropout, train);
                Ok(self.ffn_norm.forward(&(x + ffn_out)))
            }
        }
    }
}

use serde::{Deserialize, Serialize};

/// Architecture families this library builds. A closed set: dispatch goes
/// through explicit family → constructor maps, not subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    Bert,
    Roberta,
    GptNeox,
    Llama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

/// Whether layer normalization runs before or after each sublayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormPlacement {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Gelu,
    Silu,
}

/// Rotary position embedding parameters. `fraction` is the share of each
/// head's width that rotates (GPT-NeoX checkpoints rotate a prefix).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotaryConfig {
    pub fraction: f64,
    pub base: f64,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        RotaryConfig {
            fraction: 1.0,
            base: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub vocab_size: i64,
    pub hidden_width: i64,
    /// Size of the learned (or sinusoidal) position table; `None` when the
    /// architecture positions through rotation inside attention.
    pub n_positions: Option<i64>,
    /// Use a fixed sinusoidal table instead of a learned one.
    pub sinusoidal: bool,
    /// Number of segment/type embeddings, when the architecture has them.
    pub n_types: Option<i64>,
    /// Padding piece id; used to derive attention masks and, with
    /// `position_offset`, RoBERTa-style position numbering.
    pub padding_id: Option<i64>,
    /// Added to every derived position id (RoBERTa starts at pad + 1).
    pub position_offset: i64,
    /// Layer-normalize the summed embeddings (encoder families do,
    /// rotary-position decoders don't).
    pub normalize: bool,
    pub layer_norm_eps: f64,
    pub dropout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub n_query_heads: i64,
    pub n_kv_heads: i64,
    pub rotary: Option<RotaryConfig>,
    pub use_bias: bool,
}

impl AttentionConfig {
    pub fn head_dim(&self, hidden_width: i64) -> i64 {
        hidden_width / self.n_query_heads
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub n_layers: i64,
    pub hidden_width: i64,
    pub intermediate_width: i64,
    pub activation: Activation,
    /// Gated feed-forward (LLaMA): `down(act(gate(x)) * up(x))`.
    pub gated_ffn: bool,
    pub norm: NormKind,
    pub norm_placement: NormPlacement,
    pub norm_eps: f64,
    pub use_bias: bool,
    pub dropout: f64,
}

/// Immutable construction-time parameters for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub family: ModelFamily,
    pub embedding: EmbeddingConfig,
    pub attention: AttentionConfig,
    pub layer: LayerConfig,
}

impl ModelConfig {
    /// BERT base shape; encoders use post-sublayer LayerNorm and learned
    /// positions.
    pub fn bert() -> Self {
        ModelConfig {
            family: ModelFamily::Bert,
            embedding: EmbeddingConfig {
                vocab_size: 28_996,
                hidden_width: 768,
                n_positions: Some(512),
                sinusoidal: false,
                n_types: Some(2),
                padding_id: Some(0),
                position_offset: 0,
                normalize: true,
                layer_norm_eps: 1e-12,
                dropout: 0.1,
            },
            attention: AttentionConfig {
                n_query_heads: 12,
                n_kv_heads: 12,
                rotary: None,
                use_bias: true,
            },
            layer: LayerConfig {
                n_layers: 12,
                hidden_width: 768,
                intermediate_width: 3072,
                activation: Activation::Gelu,
                gated_ffn: false,
                norm: NormKind::LayerNorm,
                norm_placement: NormPlacement::Post,
                norm_eps: 1e-12,
                use_bias: true,
                dropout: 0.1,
            },
        }
    }

    /// RoBERTa: the BERT stack with offset position numbering and a larger
    /// vocabulary.
    pub fn roberta() -> Self {
        let mut config = Self::bert();
        config.family = ModelFamily::Roberta;
        config.embedding.vocab_size = 50_265;
        config.embedding.padding_id = Some(1);
        config.embedding.position_offset = 2;
        config.embedding.n_positions = Some(514);
        config.embedding.layer_norm_eps = 1e-5;
        config.layer.norm_eps = 1e-5;
        config
    }

    /// GPT-NeoX: pre-norm causal decoder, partial rotary, biased
    /// projections.
    pub fn gpt_neox() -> Self {
        ModelConfig {
            family: ModelFamily::GptNeox,
            embedding: EmbeddingConfig {
                vocab_size: 50_432,
                hidden_width: 2560,
                n_positions: None,
                sinusoidal: false,
                n_types: None,
                padding_id: None,
                position_offset: 0,
                normalize: false,
                layer_norm_eps: 1e-5,
                dropout: 0.0,
            },
            attention: AttentionConfig {
                n_query_heads: 32,
                n_kv_heads: 32,
                rotary: Some(RotaryConfig {
                    fraction: 0.25,
                    base: 10_000.0,
                }),
                use_bias: true,
            },
            layer: LayerConfig {
                n_layers: 32,
                hidden_width: 2560,
                intermediate_width: 10_240,
                activation: Activation::Gelu,
                gated_ffn: false,
                norm: NormKind::LayerNorm,
                norm_placement: NormPlacement::Pre,
                norm_eps: 1e-5,
                use_bias: true,
                dropout: 0.0,
            },
        }
    }

    /// LLaMA: pre-norm causal decoder with RMSNorm, gated SiLU
    /// feed-forward, full rotary, no biases.
    pub fn llama() -> Self {
        ModelConfig {
            family: ModelFamily::Llama,
            embedding: EmbeddingConfig {
                vocab_size: 32_000,
                hidden_width: 4096,
                n_positions: None,
                sinusoidal: false,
                n_types: None,
                padding_id: None,
                position_offset: 0,
                normalize: false,
                layer_norm_eps: 1e-6,
                dropout: 0.0,
            },
            attention: AttentionConfig {
                n_query_heads: 32,
                n_kv_heads: 32,
                rotary: Some(RotaryConfig::default()),
                use_bias: false,
            },
            layer: LayerConfig {
                n_layers: 32,
                hidden_width: 4096,
                intermediate_width: 11_008,
                activation: Activation::Silu,
                gated_ffn: true,
                norm: NormKind::RmsNorm,
                norm_placement: NormPlacement::Pre,
                norm_eps: 1e-6,
                use_bias: false,
                dropout: 0.0,
            },
        }
    }
}

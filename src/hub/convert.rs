use std::collections::HashMap;

use serde::Deserialize;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::models::config::{
    Activation, AttentionConfig, EmbeddingConfig, LayerConfig, ModelConfig, ModelFamily, NormKind,
    NormPlacement, RotaryConfig,
};

/// Map a vendor config JSON onto the local model configuration.
pub fn convert_config(family: ModelFamily, vendor: &serde_json::Value) -> Result<ModelConfig> {
    match family {
        ModelFamily::Bert | ModelFamily::Roberta => convert_bert_config(family, vendor),
        ModelFamily::GptNeox => convert_gpt_neox_config(vendor),
        ModelFamily::Llama => convert_llama_config(vendor),
    }
}

/// Rename a vendor state dict to the local parameter naming scheme,
/// splitting fused projections where the vendor uses them. Vendor-only
/// buffers (poolers, rotary frequency caches) are dropped.
pub fn convert_state_dict(
    config: &ModelConfig,
    raw: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    match config.family {
        ModelFamily::Bert | ModelFamily::Roberta => {
            rename_all(raw, |name| rename_bert(name))
        }
        ModelFamily::Llama => {
            let mut state = rename_all(raw, |name| rename_llama(name))?;
            // Tied output embeddings ship without a separate lm_head.
            if !state.contains_key("output_embeddings.weight") {
                if let Some(embeddings) = state.get("embeddings.piece_embeddings.weight") {
                    state.insert(
                        "output_embeddings.weight".to_string(),
                        embeddings.shallow_clone(),
                    );
                }
            }
            Ok(state)
        }
        ModelFamily::GptNeox => convert_gpt_neox_state_dict(config, raw),
    }
}

fn parse_section<'a, T: Deserialize<'a>>(
    family: ModelFamily,
    vendor: &'a serde_json::Value,
) -> Result<T> {
    T::deserialize(vendor).map_err(|e| {
        LmError::config(format!(
            "vendor config is not a valid {family:?} config: {e}"
        ))
    })
}

#[derive(Debug, Deserialize)]
struct HfBertConfig {
    vocab_size: i64,
    hidden_size: i64,
    num_hidden_layers: i64,
    num_attention_heads: i64,
    intermediate_size: i64,
    max_position_embeddings: i64,
    #[serde(default = "default_type_vocab_size")]
    type_vocab_size: i64,
    #[serde(default)]
    pad_token_id: i64,
    #[serde(default = "default_layer_norm_eps")]
    layer_norm_eps: f64,
    #[serde(default = "default_dropout")]
    hidden_dropout_prob: f64,
}

fn default_type_vocab_size() -> i64 {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_dropout() -> f64 {
    0.1
}

fn convert_bert_config(family: ModelFamily, vendor: &serde_json::Value) -> Result<ModelConfig> {
    let hf: HfBertConfig = parse_section(family, vendor)?;
    // RoBERTa numbers positions from pad_token_id + 1.
    let position_offset = match family {
        ModelFamily::Roberta => hf.pad_token_id + 1,
        _ => 0,
    };
    Ok(ModelConfig {
        family,
        embedding: EmbeddingConfig {
            vocab_size: hf.vocab_size,
            hidden_width: hf.hidden_size,
            n_positions: Some(hf.max_position_embeddings),
            sinusoidal: false,
            n_types: Some(hf.type_vocab_size),
            padding_id: Some(hf.pad_token_id),
            position_offset,
            normalize: true,
            layer_norm_eps: hf.layer_norm_eps,
            dropout: hf.hidden_dropout_prob,
        },
        attention: AttentionConfig {
            n_query_heads: hf.num_attention_heads,
            n_kv_heads: hf.num_attention_heads,
            rotary: None,
            use_bias: true,
        },
        layer: LayerConfig {
            n_layers: hf.num_hidden_layers,
            hidden_width: hf.hidden_size,
            intermediate_width: hf.intermediate_size,
            activation: Activation::Gelu,
            gated_ffn: false,
            norm: NormKind::LayerNorm,
            norm_placement: NormPlacement::Post,
            norm_eps: hf.layer_norm_eps,
            use_bias: true,
            dropout: hf.hidden_dropout_prob,
        },
    })
}

#[derive(Debug, Deserialize)]
struct HfLlamaConfig {
    vocab_size: i64,
    hidden_size: i64,
    num_hidden_layers: i64,
    num_attention_heads: i64,
    num_key_value_heads: Option<i64>,
    intermediate_size: i64,
    #[serde(default = "default_rms_eps")]
    rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    rope_theta: f64,
}

fn default_rms_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn convert_llama_config(vendor: &serde_json::Value) -> Result<ModelConfig> {
    let hf: HfLlamaConfig = parse_section(ModelFamily::Llama, vendor)?;
    let mut config = ModelConfig::llama();
    config.embedding.vocab_size = hf.vocab_size;
    config.embedding.hidden_width = hf.hidden_size;
    config.attention.n_query_heads = hf.num_attention_heads;
    config.attention.n_kv_heads = hf.num_key_value_heads.unwrap_or(hf.num_attention_heads);
    config.attention.rotary = Some(RotaryConfig {
        fraction: 1.0,
        base: hf.rope_theta,
    });
    config.layer.n_layers = hf.num_hidden_layers;
    config.layer.hidden_width = hf.hidden_size;
    config.layer.intermediate_width = hf.intermediate_size;
    config.layer.norm_eps = hf.rms_norm_eps;
    config.embedding.layer_norm_eps = hf.rms_norm_eps;
    Ok(config)
}

#[derive(Debug, Deserialize)]
struct HfGptNeoxConfig {
    vocab_size: i64,
    hidden_size: i64,
    num_hidden_layers: i64,
    num_attention_heads: i64,
    intermediate_size: i64,
    #[serde(default = "default_rotary_pct")]
    rotary_pct: f64,
    #[serde(default = "default_rope_theta")]
    rotary_emb_base: f64,
    #[serde(default = "default_neox_eps")]
    layer_norm_eps: f64,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_neox_eps() -> f64 {
    1e-5
}

fn convert_gpt_neox_config(vendor: &serde_json::Value) -> Result<ModelConfig> {
    let hf: HfGptNeoxConfig = parse_section(ModelFamily::GptNeox, vendor)?;
    let mut config = ModelConfig::gpt_neox();
    config.embedding.vocab_size = hf.vocab_size;
    config.embedding.hidden_width = hf.hidden_size;
    config.embedding.layer_norm_eps = hf.layer_norm_eps;
    config.attention.n_query_heads = hf.num_attention_heads;
    config.attention.n_kv_heads = hf.num_attention_heads;
    config.attention.rotary = Some(RotaryConfig {
        fraction: hf.rotary_pct,
        base: hf.rotary_emb_base,
    });
    config.layer.n_layers = hf.num_hidden_layers;
    config.layer.hidden_width = hf.hidden_size;
    config.layer.intermediate_width = hf.intermediate_size;
    config.layer.norm_eps = hf.layer_norm_eps;
    Ok(config)
}

fn rename_all(
    raw: HashMap<String, Tensor>,
    rename: impl Fn(&str) -> Option<String>,
) -> Result<HashMap<String, Tensor>> {
    Ok(raw
        .into_iter()
        .filter_map(|(name, tensor)| rename(&name).map(|local| (local, tensor)))
        .collect())
}

fn rename_bert(name: &str) -> Option<String> {
    let name = name
        .strip_prefix("bert.")
        .or_else(|| name.strip_prefix("roberta."))
        .unwrap_or(name);
    if name.starts_with("pooler.") || name.starts_with("cls.") || name.ends_with("position_ids") {
        return None;
    }

    if let Some(rest) = name.strip_prefix("embeddings.") {
        let mapped = match rest {
            "word_embeddings.weight" => "piece_embeddings.weight",
            "position_embeddings.weight" => "position_embeddings.weight",
            "token_type_embeddings.weight" => "type_embeddings.weight",
            "LayerNorm.weight" => "norm.weight",
            "LayerNorm.bias" => "norm.bias",
            _ => return None,
        };
        return Some(format!("embeddings.{mapped}"));
    }

    let rest = name.strip_prefix("encoder.layer.")?;
    let (index, tail) = rest.split_once('.')?;
    let mapped = match tail {
        "attention.self.query.weight" => "attention.query.weight",
        "attention.self.query.bias" => "attention.query.bias",
        "attention.self.key.weight" => "attention.key.weight",
        "attention.self.key.bias" => "attention.key.bias",
        "attention.self.value.weight" => "attention.value.weight",
        "attention.self.value.bias" => "attention.value.bias",
        "attention.output.dense.weight" => "attention.output.weight",
        "attention.output.dense.bias" => "attention.output.bias",
        "attention.output.LayerNorm.weight" => "attention_norm.weight",
        "attention.output.LayerNorm.bias" => "attention_norm.bias",
        "intermediate.dense.weight" => "ffn.up.weight",
        "intermediate.dense.bias" => "ffn.up.bias",
        "output.dense.weight" => "ffn.down.weight",
        "output.dense.bias" => "ffn.down.bias",
        "output.LayerNorm.weight" => "ffn_norm.weight",
        "output.LayerNorm.bias" => "ffn_norm.bias",
        _ => return None,
    };
    Some(format!("layers.{index}.{mapped}"))
}

fn rename_llama(name: &str) -> Option<String> {
    if name == "lm_head.weight" {
        return Some("output_embeddings.weight".to_string());
    }
    let name = name.strip_prefix("model.").unwrap_or(name);
    if name == "embed_tokens.weight" {
        return Some("embeddings.piece_embeddings.weight".to_string());
    }
    if name == "norm.weight" {
        return Some("output_norm.weight".to_string());
    }

    let rest = name.strip_prefix("layers.")?;
    let (index, tail) = rest.split_once('.')?;
    let mapped = match tail {
        "self_attn.q_proj.weight" => "attention.query.weight",
        "self_attn.k_proj.weight" => "attention.key.weight",
        "self_attn.v_proj.weight" => "attention.value.weight",
        "self_attn.o_proj.weight" => "attention.output.weight",
        "mlp.gate_proj.weight" => "ffn.gate.weight",
        "mlp.up_proj.weight" => "ffn.up.weight",
        "mlp.down_proj.weight" => "ffn.down.weight",
        "input_layernorm.weight" => "attention_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        // Rotary frequency caches are derived, not parameters.
        "self_attn.rotary_emb.inv_freq" => return None,
        _ => return None,
    };
    Some(format!("layers.{index}.{mapped}"))
}

fn convert_gpt_neox_state_dict(
    config: &ModelConfig,
    raw: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let n_heads = config.attention.n_query_heads;
    let width = config.layer.hidden_width;
    let head_dim = config.attention.head_dim(width);

    let mut state = HashMap::with_capacity(raw.len());
    for (name, tensor) in raw {
        if name == "embed_out.weight" {
            state.insert("output_embeddings.weight".to_string(), tensor);
            continue;
        }
        let stripped = match name.strip_prefix("gpt_neox.") {
            Some(stripped) => stripped,
            None => continue,
        };
        match stripped {
            "embed_in.weight" => {
                state.insert("embeddings.piece_embeddings.weight".to_string(), tensor);
                continue;
            }
            "final_layer_norm.weight" => {
                state.insert("output_norm.weight".to_string(), tensor);
                continue;
            }
            "final_layer_norm.bias" => {
                state.insert("output_norm.bias".to_string(), tensor);
                continue;
            }
            _ => {}
        }

        let Some(rest) = stripped.strip_prefix("layers.") else {
            continue;
        };
        let Some((index, tail)) = rest.split_once('.') else {
            continue;
        };

        // The fused query_key_value projection interleaves per head; pull
        // it apart into the three separate projections.
        if tail == "attention.query_key_value.weight" {
            let per_head = tensor.view([n_heads, 3, head_dim, width]);
            for (slot, proj) in ["query", "key", "value"].iter().enumerate() {
                let part = per_head
                    .select(1, slot as i64)
                    .reshape([n_heads * head_dim, width]);
                state.insert(
                    format!("layers.{index}.attention.{proj}.weight"),
                    part.contiguous(),
                );
            }
            continue;
        }
        if tail == "attention.query_key_value.bias" {
            let per_head = tensor.view([n_heads, 3, head_dim]);
            for (slot, proj) in ["query", "key", "value"].iter().enumerate() {
                let part = per_head.select(1, slot as i64).reshape([n_heads * head_dim]);
                state.insert(
                    format!("layers.{index}.attention.{proj}.bias"),
                    part.contiguous(),
                );
            }
            continue;
        }

        let mapped = match tail {
            "attention.dense.weight" => "attention.output.weight",
            "attention.dense.bias" => "attention.output.bias",
            "mlp.dense_h_to_4h.weight" => "ffn.up.weight",
            "mlp.dense_h_to_4h.bias" => "ffn.up.bias",
            "mlp.dense_4h_to_h.weight" => "ffn.down.weight",
            "mlp.dense_4h_to_h.bias" => "ffn.down.bias",
            "input_layernorm.weight" => "attention_norm.weight",
            "input_layernorm.bias" => "attention_norm.bias",
            "post_attention_layernorm.weight" => "ffn_norm.weight",
            "post_attention_layernorm.bias" => "ffn_norm.bias",
            // Derived buffers, not parameters.
            "attention.bias" | "attention.masked_bias" | "attention.rotary_emb.inv_freq" => {
                continue
            }
            _ => continue,
        };
        state.insert(format!("layers.{index}.{mapped}"), tensor);
    }
    Ok(state)
}

use log::warn;
use tch::Device;

use crate::error::{LmError, Result};
use crate::hub::convert::{convert_config, convert_state_dict};
use crate::hub::fetch::Hub;
use crate::hub::load::Params;
use crate::models::causal_lm::CausalLM;
use crate::models::config::ModelFamily;
use crate::models::encoder::EncoderModel;
use crate::quant::{modules_to_not_quantize, quantize_state_dict, QuantizationConfig};

/// Vendor `model_type` strings the encoder factory accepts.
pub const SUPPORTED_ENCODER_TYPES: &[(&str, ModelFamily)] =
    &[("bert", ModelFamily::Bert), ("roberta", ModelFamily::Roberta)];

/// Vendor `model_type` strings the causal LM factory accepts.
pub const SUPPORTED_CAUSAL_LM_TYPES: &[(&str, ModelFamily)] =
    &[("gpt_neox", ModelFamily::GptNeox), ("llama", ModelFamily::Llama)];

/// Resolve a vendor config's `model_type` against a supported set.
fn resolve_family(
    config: &serde_json::Value,
    supported: &[(&str, ModelFamily)],
) -> Result<ModelFamily> {
    let model_type = config
        .get("model_type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| LmError::config("vendor config has no model_type field"))?;
    supported
        .iter()
        .find(|(name, _)| *name == model_type)
        .map(|(_, family)| *family)
        .ok_or_else(|| {
            let names: Vec<&str> = supported.iter().map(|(name, _)| *name).collect();
            LmError::config(format!(
                "unsupported model type `{model_type}`; supported model types: {names:?}"
            ))
        })
}

/// Shared "fetch, resolve, convert, construct" sequence behind both
/// factories.
fn fetch_and_convert(
    hub: &dyn Hub,
    name: &str,
    revision: &str,
    device: Device,
    quantization: Option<&QuantizationConfig>,
    supported: &[(&str, ModelFamily)],
) -> Result<(crate::models::config::ModelConfig, Params)> {
    let blobs = hub.fetch(name, revision)?;
    let family = resolve_family(&blobs.config, supported)?;
    let config = convert_config(family, &blobs.config)?;
    let mut state = convert_state_dict(&config, blobs.state_dict)?;
    if let Some(quantization) = quantization {
        quantize_state_dict(&mut state, quantization, &modules_to_not_quantize(family))?;
    }
    Ok((config, Params::from_state_dict(state, device)))
}

fn warn_on_unused(name: &str, params: &Params) {
    let unused = params.unused();
    if !unused.is_empty() {
        warn!("{name}: {} converted parameters were not used: {unused:?}", unused.len());
    }
}

/// Encoder loaded from a hub by name and revision.
pub struct AutoEncoder;

impl AutoEncoder {
    pub fn from_hub(
        hub: &dyn Hub,
        name: &str,
        revision: &str,
        device: Device,
        quantization: Option<&QuantizationConfig>,
    ) -> Result<EncoderModel> {
        let (config, mut params) = fetch_and_convert(
            hub,
            name,
            revision,
            device,
            quantization,
            SUPPORTED_ENCODER_TYPES,
        )?;
        let model = EncoderModel::new(config, &mut params)?;
        warn_on_unused(name, &params);
        Ok(model)
    }
}

/// Causal LM loaded from a hub by name and revision.
pub struct AutoCausalLM;

impl AutoCausalLM {
    pub fn from_hub(
        hub: &dyn Hub,
        name: &str,
        revision: &str,
        device: Device,
        quantization: Option<&QuantizationConfig>,
    ) -> Result<CausalLM> {
        let (config, mut params) = fetch_and_convert(
            hub,
            name,
            revision,
            device,
            quantization,
            SUPPORTED_CAUSAL_LM_TYPES,
        )?;
        let model = CausalLM::new(config, &mut params)?;
        warn_on_unused(name, &params);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_model_type_lists_supported_alternatives() {
        let config = json!({"model_type": "mamba"});
        let err = resolve_family(&config, SUPPORTED_CAUSAL_LM_TYPES).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mamba"));
        assert!(message.contains("gpt_neox"));
        assert!(message.contains("llama"));
    }

    #[test]
    fn missing_model_type_is_a_configuration_error() {
        let config = json!({"hidden_size": 16});
        assert!(resolve_family(&config, SUPPORTED_ENCODER_TYPES).is_err());
    }

    #[test]
    fn encoder_and_causal_lm_sets_are_disjoint() {
        let config = json!({"model_type": "bert"});
        assert!(resolve_family(&config, SUPPORTED_ENCODER_TYPES).is_ok());
        assert!(resolve_family(&config, SUPPORTED_CAUSAL_LM_TYPES).is_err());
    }
}

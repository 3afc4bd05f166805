use std::collections::{HashMap, HashSet};

use log::debug;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::models::config::ModelFamily;

/// Group-wise quantization schemes for linear-projection weights.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuantType {
    /// 8-bit symmetric, one scale per group.
    Q8_0,
    /// 4-bit, two values packed per byte, one scale per group.
    Q4_0,
}

#[derive(Debug, Clone)]
pub struct QuantizationConfig {
    pub quant_type: QuantType,
    pub group_size: usize,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        QuantizationConfig {
            quant_type: QuantType::Q8_0,
            group_size: 32,
        }
    }
}

/// A weight tensor in reduced-precision storage.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    data: Vec<i8>,
    scales: Vec<f32>,
    quant_type: QuantType,
    group_size: usize,
    shape: Vec<i64>,
}

impl QuantizedTensor {
    pub fn quantize(tensor: &Tensor, config: &QuantizationConfig) -> Result<Self> {
        let shape = tensor.size();
        let flat = tensor.to_kind(tch::Kind::Float).flatten(0, -1);
        let values = Vec::<f32>::try_from(&flat).map_err(LmError::Tensor)?;
        let (data, scales) = match config.quant_type {
            QuantType::Q8_0 => quantize_q8_0(&values, config.group_size),
            QuantType::Q4_0 => quantize_q4_0(&values, config.group_size),
        };
        Ok(QuantizedTensor {
            data,
            scales,
            quant_type: config.quant_type,
            group_size: config.group_size,
            shape,
        })
    }

    pub fn dequantize(&self) -> Tensor {
        let values = match self.quant_type {
            QuantType::Q8_0 => dequantize_q8_0(&self.data, &self.scales, self.group_size),
            QuantType::Q4_0 => dequantize_q4_0(&self.data, &self.scales, self.group_size),
        };
        Tensor::from_slice(&values).reshape(&self.shape[..])
    }

    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }
}

fn group_scale(chunk: &[f32], max_quant: f32) -> f32 {
    let max_abs = chunk
        .iter()
        .map(|&x| x.abs())
        .filter(|x| !x.is_nan())
        .fold(0f32, f32::max);
    if max_abs == 0.0 {
        1.0
    } else {
        max_abs / max_quant
    }
}

fn quantize_q8_0(values: &[f32], group_size: usize) -> (Vec<i8>, Vec<f32>) {
    let mut data = Vec::with_capacity(values.len());
    let mut scales = Vec::with_capacity(values.len().div_ceil(group_size));
    for chunk in values.chunks(group_size) {
        let scale = group_scale(chunk, 127.0);
        scales.push(scale);
        data.extend(
            chunk
                .iter()
                .map(|&x| (x / scale).round().clamp(-127.0, 127.0) as i8),
        );
    }
    (data, scales)
}

fn dequantize_q8_0(data: &[i8], scales: &[f32], group_size: usize) -> Vec<f32> {
    data.iter()
        .enumerate()
        .map(|(i, &q)| q as f32 * scales[i / group_size])
        .collect()
}

/// 4-bit values are shifted into 0..=15 and packed low-nibble first.
fn quantize_q4_0(values: &[f32], group_size: usize) -> (Vec<i8>, Vec<f32>) {
    let mut data = Vec::with_capacity(values.len() / 2 + 1);
    let mut scales = Vec::with_capacity(values.len().div_ceil(group_size));
    for chunk in values.chunks(group_size) {
        let scale = group_scale(chunk, 7.0);
        scales.push(scale);
        for pair in chunk.chunks(2) {
            let low = ((pair[0] / scale).round() + 8.0).clamp(0.0, 15.0) as u8;
            let high = match pair.get(1) {
                Some(&x) => ((x / scale).round() + 8.0).clamp(0.0, 15.0) as u8,
                None => 8,
            };
            data.push((low | (high << 4)) as i8);
        }
    }
    (data, scales)
}

fn dequantize_q4_0(data: &[i8], scales: &[f32], group_size: usize) -> Vec<f32> {
    let packed_per_group = group_size / 2;
    let mut values = Vec::with_capacity(data.len() * 2);
    for (i, &packed) in data.iter().enumerate() {
        let scale = scales[i / packed_per_group];
        let low = (packed as u8) & 0x0F;
        let high = (packed as u8) >> 4;
        values.push((low as f32 - 8.0) * scale);
        values.push((high as f32 - 8.0) * scale);
    }
    values
}

/// Parameter-name prefixes a quantization collaborator must leave alone.
///
/// Embedding tables are lookup tables rather than projections, and causal
/// LMs additionally keep the output embedding in full precision.
pub fn modules_to_not_quantize(family: ModelFamily) -> HashSet<&'static str> {
    let mut excluded = HashSet::from(["embeddings"]);
    match family {
        ModelFamily::GptNeox | ModelFamily::Llama => {
            excluded.insert("output_embeddings");
        }
        ModelFamily::Bert | ModelFamily::Roberta => {}
    }
    excluded
}

/// Pass every eligible linear weight through reduced-precision storage,
/// honoring the exclusion prefixes.
pub fn quantize_state_dict(
    state: &mut HashMap<String, Tensor>,
    config: &QuantizationConfig,
    excluded_prefixes: &HashSet<&str>,
) -> Result<()> {
    let names: Vec<String> = state
        .keys()
        .filter(|name| {
            name.ends_with(".weight")
                && !excluded_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
        })
        .cloned()
        .collect();

    let mut quantized_count = 0usize;
    for name in names {
        let tensor = &state[&name];
        if tensor.dim() != 2 {
            continue;
        }
        let quantized = QuantizedTensor::quantize(tensor, config)?;
        state.insert(name, quantized.dequantize());
        quantized_count += 1;
    }
    debug!("quantized {quantized_count} weight tensors ({:?})", config.quant_type);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn q8_round_trip_is_close() {
        let tensor = Tensor::randn(&[16, 8], (Kind::Float, Device::Cpu));
        let config = QuantizationConfig::default();
        let quantized = QuantizedTensor::quantize(&tensor, &config).unwrap();
        let restored = quantized.dequantize();
        assert_eq!(restored.size(), tensor.size());
        // 8-bit symmetric: worst case half a step per group scale.
        assert!(restored.allclose(&tensor, 0.02, 0.02, false));
    }

    #[test]
    fn q4_round_trip_preserves_shape_and_scale() {
        let tensor = Tensor::randn(&[8, 8], (Kind::Float, Device::Cpu));
        let config = QuantizationConfig {
            quant_type: QuantType::Q4_0,
            group_size: 16,
        };
        let quantized = QuantizedTensor::quantize(&tensor, &config).unwrap();
        let restored = quantized.dequantize();
        assert_eq!(restored.size(), tensor.size());
        // 4-bit steps are coarse: half a step per group scale.
        assert!(restored.allclose(&tensor, 0.1, 0.4, false));
    }

    #[test]
    fn zero_group_does_not_divide_by_zero() {
        let tensor = Tensor::zeros(&[4, 8], (Kind::Float, Device::Cpu));
        let quantized = QuantizedTensor::quantize(&tensor, &QuantizationConfig::default()).unwrap();
        let restored = quantized.dequantize();
        assert!(restored.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn exclusions_are_skipped() {
        let mut state = HashMap::new();
        let precise = Tensor::from_slice(&[0.123456f32, -0.654321, 0.5, -0.25])
            .reshape([2, 2]);
        state.insert("output_embeddings.weight".to_string(), precise.shallow_clone());
        state.insert("layers.0.attention.query.weight".to_string(), precise.shallow_clone());

        let excluded = modules_to_not_quantize(ModelFamily::Llama);
        quantize_state_dict(&mut state, &QuantizationConfig::default(), &excluded).unwrap();

        // Excluded tensor is bit-identical; the projection went through
        // reduced precision.
        assert!(state["output_embeddings.weight"].equal(&precise));
        assert!(!state["layers.0.attention.query.weight"].equal(&precise));
    }

    #[test]
    fn non_matrix_weights_are_left_alone() {
        let mut state = HashMap::new();
        let norm = Tensor::from_slice(&[0.1f32, 0.2, 0.3]);
        state.insert("layers.0.attention_norm.weight".to_string(), norm.shallow_clone());
        quantize_state_dict(&mut state, &QuantizationConfig::default(), &HashSet::new()).unwrap();
        assert!(state["layers.0.attention_norm.weight"].equal(&norm));
    }
}

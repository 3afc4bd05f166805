use std::collections::HashMap;

use rayon::prelude::*;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tch::{Device, Kind, Tensor};

use crate::error::{LmError, Result};

/// Parameter source handed to module constructors.
///
/// Either draws named tensors out of a converted state dict (shapes are
/// validated against what the module expects) or synthesizes fresh
/// randomly-initialized parameters when no checkpoint is being loaded.
pub struct Params {
    source: Option<HashMap<String, Tensor>>,
    device: Device,
    kind: Kind,
}

impl Params {
    pub fn from_state_dict(state: HashMap<String, Tensor>, device: Device) -> Self {
        Params {
            source: Some(state),
            device,
            kind: Kind::Float,
        }
    }

    /// Fresh parameters drawn from a scaled normal distribution; used for
    /// uninitialized models (and deterministic under `tch::manual_seed`).
    pub fn random(device: Device) -> Self {
        Params {
            source: None,
            device,
            kind: Kind::Float,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn take(&mut self, name: &str, shape: &[i64]) -> Result<Tensor> {
        match &mut self.source {
            Some(map) => {
                let tensor = map.remove(name).ok_or_else(|| LmError::WeightLoading {
                    name: name.to_string(),
                    reason: "missing from checkpoint".to_string(),
                })?;
                if tensor.size() != shape {
                    return Err(LmError::WeightLoading {
                        name: name.to_string(),
                        reason: format!("expected shape {:?}, checkpoint has {:?}", shape, tensor.size()),
                    });
                }
                Ok(tensor.to_kind(self.kind).to_device(self.device))
            }
            None => Ok(Tensor::randn(shape, (self.kind, self.device)) * 0.02),
        }
    }

    /// Names that were supplied but never taken by a module constructor.
    pub fn unused(&self) -> Vec<String> {
        match &self.source {
            Some(map) => {
                let mut names: Vec<String> = map.keys().cloned().collect();
                names.sort();
                names
            }
            None => Vec::new(),
        }
    }
}

/// Deserialize a safetensors blob into named tch tensors.
pub fn state_dict_from_safetensors(bytes: &[u8]) -> Result<HashMap<String, Tensor>> {
    let safetensors = SafeTensors::deserialize(bytes)?;
    let names = safetensors.names();
    names
        .par_iter()
        .map(|&name| {
            let view = safetensors.tensor(name).map_err(|e| LmError::WeightLoading {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            Ok((name.to_string(), tensor_from_view(name, &view)?))
        })
        .collect()
}

fn tensor_from_view(name: &str, view: &TensorView<'_>) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&dim| dim as i64).collect();
    let raw = view.data();
    let tensor = match view.dtype() {
        Dtype::F32 => {
            let data: Vec<f32> = bytemuck::pod_collect_to_vec(raw);
            Tensor::from_slice(&data)
        }
        Dtype::F16 => {
            let bits: Vec<u16> = bytemuck::pod_collect_to_vec(raw);
            let data: Vec<f32> = bits
                .into_iter()
                .map(|b| half::f16::from_bits(b).to_f32())
                .collect();
            Tensor::from_slice(&data)
        }
        Dtype::BF16 => {
            let bits: Vec<u16> = bytemuck::pod_collect_to_vec(raw);
            let data: Vec<f32> = bits
                .into_iter()
                .map(|b| half::bf16::from_bits(b).to_f32())
                .collect();
            Tensor::from_slice(&data)
        }
        Dtype::I64 => {
            let data: Vec<i64> = bytemuck::pod_collect_to_vec(raw);
            Tensor::from_slice(&data)
        }
        other => {
            return Err(LmError::WeightLoading {
                name: name.to_string(),
                reason: format!("unsupported dtype {other:?}"),
            })
        }
    };
    Ok(tensor.reshape(&shape))
}

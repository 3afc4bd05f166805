use log::debug;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::models::causal_lm::CausalLM;
use crate::sampler::Sampler;

/// Stop conditions and bounds for one generation run.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_new_pieces: usize,
    pub eos_id: Option<u32>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            max_new_pieces: 128,
            eos_id: None,
        }
    }
}

/// Decoding progress. Each forward call receives only the pieces the cache
/// has not seen; the cache length increases monotonically until the loop
/// stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Empty,
    Primed,
    Extending,
    Done,
}

/// Drives repeated single-step forward passes over a causal LM, growing
/// the key-value cache and sampling one piece per step.
pub struct Generator<'a> {
    model: &'a CausalLM,
    sampler: Sampler,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a CausalLM, sampler: Sampler) -> Self {
        Generator { model, sampler }
    }

    /// Generate continuations for a prompt. Returns the newly generated
    /// ids (the prompt is not repeated, and the stop piece is not
    /// included).
    pub fn generate(&mut self, prompt_ids: &[u32], config: &GeneratorConfig) -> Result<Vec<u32>> {
        if prompt_ids.is_empty() {
            return Err(LmError::config("cannot generate from an empty prompt"));
        }

        let capacity = (prompt_ids.len() + config.max_new_pieces) as i64;
        let mut cache = self.model.new_cache_with_capacity(capacity);
        let mut state = DecodeState::Empty;
        let mut input: Vec<i64> = prompt_ids.iter().map(|&id| id as i64).collect();
        let mut generated = Vec::new();

        while state != DecodeState::Done {
            let ids = Tensor::from_slice(&input).view([1, input.len() as i64]);
            let output = self.model.forward(&ids, None, Some(&mut cache), false)?;
            state = match state {
                DecodeState::Empty => DecodeState::Primed,
                _ => DecodeState::Extending,
            };
            debug!("decode state {state:?}, cache length {}", cache.seen_len());

            let logits = Vec::<f32>::try_from(&output.logits.reshape([-1]))?;
            let next = self.sampler.sample(&logits);

            if Some(next) == config.eos_id {
                state = DecodeState::Done;
                continue;
            }
            generated.push(next);
            if generated.len() >= config.max_new_pieces {
                state = DecodeState::Done;
                continue;
            }
            input = vec![next as i64];
        }

        Ok(generated)
    }
}

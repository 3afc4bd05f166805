use tch::Tensor;

use crate::error::{LmError, Result};

/// Keys and values for one decoder layer, kept in a preallocated buffer
/// with a tracked logical length so repeated single-piece appends do not
/// reallocate.
#[derive(Debug)]
struct LayerBuffer {
    key: Tensor,
    value: Tensor,
    len: i64,
}

/// Per-layer cache of previously computed attention keys and values,
/// shaped `[batch, kv_heads, seen_len, head_dim]` per layer.
///
/// Owned exclusively by one decoding call at a time; the length only ever
/// grows. Batch size and head geometry are fixed by the first append.
#[derive(Debug)]
pub struct KeyValueCache {
    buffers: Vec<Option<LayerBuffer>>,
    capacity_hint: i64,
}

impl KeyValueCache {
    pub fn new(n_layers: usize) -> Self {
        Self::with_capacity(n_layers, 0)
    }

    /// Preallocate for a known maximum decode length; appends beyond the
    /// capacity fall back to doubling growth.
    pub fn with_capacity(n_layers: usize, capacity: i64) -> Self {
        KeyValueCache {
            buffers: (0..n_layers).map(|_| None).collect(),
            capacity_hint: capacity,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.buffers.len()
    }

    /// Pieces seen so far (0 until the cache is primed).
    pub fn seen_len(&self) -> i64 {
        self.buffers
            .first()
            .and_then(|slot| slot.as_ref())
            .map_or(0, |buffer| buffer.len)
    }

    /// Length already stored for one layer; differs from `seen_len` only
    /// mid-step, while earlier layers have appended and later ones not.
    pub(crate) fn past_len(&self, layer: usize) -> i64 {
        self.buffers
            .get(layer)
            .and_then(|slot| slot.as_ref())
            .map_or(0, |buffer| buffer.len)
    }

    pub fn batch_size(&self) -> Option<i64> {
        self.buffers
            .first()
            .and_then(|slot| slot.as_ref())
            .map(|buffer| buffer.key.size()[0])
    }

    /// Check this cache against a model's geometry before any computation.
    pub fn validate(
        &self,
        n_layers: usize,
        batch: i64,
        n_kv_heads: i64,
        head_dim: i64,
    ) -> Result<()> {
        if self.n_layers() != n_layers {
            return Err(LmError::config(format!(
                "cache has {} layers, model has {n_layers}",
                self.n_layers()
            )));
        }
        if let Some(buffer) = self.buffers.first().and_then(|slot| slot.as_ref()) {
            let size = buffer.key.size();
            if size[0] != batch {
                return Err(LmError::config(format!(
                    "cache batch size {} does not match input batch size {batch}",
                    size[0]
                )));
            }
            if size[1] != n_kv_heads || size[3] != head_dim {
                return Err(LmError::config(format!(
                    "cache head geometry [{}, {}] does not match model [{n_kv_heads}, {head_dim}]",
                    size[1], size[3]
                )));
            }
        }
        Ok(())
    }

    /// Append newly computed keys/values (`[batch, kv_heads, new_len,
    /// head_dim]`) for one layer and return views over the full cached
    /// run including them.
    pub(crate) fn append(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let capacity_hint = self.capacity_hint;
        let slot = self.buffers.get_mut(layer).ok_or_else(|| {
            LmError::config(format!("cache has no layer {layer}"))
        })?;
        let new_len = key.size()[2];

        match slot {
            None => {
                let mut size = key.size();
                let capacity = capacity_hint.max(new_len);
                size[2] = capacity;
                let key_buffer = Tensor::zeros(&size[..], (key.kind(), key.device()));
                let value_buffer = Tensor::zeros(&size[..], (value.kind(), value.device()));
                key_buffer.narrow(2, 0, new_len).copy_(key);
                value_buffer.narrow(2, 0, new_len).copy_(value);
                *slot = Some(LayerBuffer {
                    key: key_buffer,
                    value: value_buffer,
                    len: new_len,
                });
            }
            Some(buffer) => {
                let capacity = buffer.key.size()[2];
                if buffer.len + new_len > capacity {
                    let grown = (capacity * 2).max(buffer.len + new_len);
                    let mut size = buffer.key.size();
                    size[2] = grown;
                    let key_buffer = Tensor::zeros(&size[..], (key.kind(), key.device()));
                    let value_buffer = Tensor::zeros(&size[..], (value.kind(), value.device()));
                    key_buffer
                        .narrow(2, 0, buffer.len)
                        .copy_(&buffer.key.narrow(2, 0, buffer.len));
                    value_buffer
                        .narrow(2, 0, buffer.len)
                        .copy_(&buffer.value.narrow(2, 0, buffer.len));
                    buffer.key = key_buffer;
                    buffer.value = value_buffer;
                }
                buffer.key.narrow(2, buffer.len, new_len).copy_(key);
                buffer.value.narrow(2, buffer.len, new_len).copy_(value);
                buffer.len += new_len;
            }
        }

        let buffer = slot.as_ref().expect("just filled");
        Ok((
            buffer.key.narrow(2, 0, buffer.len),
            buffer.value.narrow(2, 0, buffer.len),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn kv(len: i64) -> Tensor {
        Tensor::randn(&[2, 4, len, 8], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn append_grows_monotonically() {
        let mut cache = KeyValueCache::new(2);
        assert_eq!(cache.seen_len(), 0);

        let (k, v) = cache.append(0, &kv(3), &kv(3)).unwrap();
        assert_eq!(k.size(), &[2, 4, 3, 8]);
        assert_eq!(v.size(), &[2, 4, 3, 8]);
        cache.append(1, &kv(3), &kv(3)).unwrap();
        assert_eq!(cache.seen_len(), 3);

        let (k, _) = cache.append(0, &kv(1), &kv(1)).unwrap();
        assert_eq!(k.size(), &[2, 4, 4, 8]);
    }

    #[test]
    fn append_preserves_earlier_contents() {
        let mut cache = KeyValueCache::with_capacity(1, 2);
        let first_k = kv(2);
        cache.append(0, &first_k, &kv(2)).unwrap();
        // Exceeds the preallocated capacity and forces a grow.
        let (k, _) = cache.append(0, &kv(1), &kv(1)).unwrap();
        assert_eq!(k.size(), &[2, 4, 3, 8]);
        assert!(k.narrow(2, 0, 2).allclose(&first_k, 1e-6, 1e-7, false));
    }

    #[test]
    fn past_len_tracks_per_layer_progress() {
        let mut cache = KeyValueCache::new(2);
        cache.append(0, &kv(2), &kv(2)).unwrap();
        assert_eq!(cache.past_len(0), 2);
        assert_eq!(cache.past_len(1), 0);
    }

    #[test]
    fn validate_catches_layer_and_batch_mismatch() {
        let mut cache = KeyValueCache::new(2);
        cache.append(0, &kv(1), &kv(1)).unwrap();
        cache.append(1, &kv(1), &kv(1)).unwrap();

        assert!(cache.validate(3, 2, 4, 8).is_err());
        assert!(cache.validate(2, 5, 4, 8).is_err());
        assert!(cache.validate(2, 2, 4, 4).is_err());
        assert!(cache.validate(2, 2, 4, 8).is_ok());
    }
}

use crate::config::ModelConfig;
use crate::core::tensor::{f32_vec_to_bytes, DType, Tensor};
use crate::error::{LoraForgeError, Result};
use crate::nn::{Layer, Linear};

/// Precomputed rotary embedding tables, split-half convention:
/// `x[..d/2]` and `x[d/2..]` form the rotated pairs.
#[derive(Clone)]
pub struct RopeFreqs {
    cos_table: Vec<f32>, // [max_positions, head_dim/2]
    sin_table: Vec<f32>,
    half_dim: usize,
    max_positions: usize,
}

impl RopeFreqs {
    pub fn new(head_dim: usize, max_positions: usize, theta: f32) -> Self {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
            .collect();

        let mut cos_table = Vec::with_capacity(max_positions * half_dim);
        let mut sin_table = Vec::with_capacity(max_positions * half_dim);
        for pos in 0..max_positions {
            for &f in &inv_freq {
                let angle = pos as f32 * f;
                cos_table.push(angle.cos());
                sin_table.push(angle.sin());
            }
        }

        Self { cos_table, sin_table, half_dim, max_positions }
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Rotate x [B, H, S, D] whose sequence starts at absolute position `start_pos`.
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let shape = x.shape();
        if shape.len() != 4 || shape[3] != self.half_dim * 2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![self.half_dim * 2],
                actual: shape.to_vec(),
            });
        }
        let (seq_len, head_dim) = (shape[2], shape[3]);
        if start_pos + seq_len > self.max_positions {
            return Err(LoraForgeError::SequenceLengthExceeded {
                max: self.max_positions,
                actual: start_pos + seq_len,
            });
        }

        let src = x.contiguous()?;
        let data = src.as_slice_f32()?;
        let half = self.half_dim;
        let mut out = vec![0.0f32; data.len()];

        for (row_idx, (row, dst)) in data.chunks_exact(head_dim).zip(out.chunks_exact_mut(head_dim)).enumerate() {
            let pos = start_pos + row_idx % seq_len;
            let cos = &self.cos_table[pos * half..(pos + 1) * half];
            let sin = &self.sin_table[pos * half..(pos + 1) * half];
            let (x1, x2) = row.split_at(half);
            for i in 0..half {
                dst[i] = x1[i] * cos[i] - x2[i] * sin[i];
                dst[half + i] = x1[i] * sin[i] + x2[i] * cos[i];
            }
        }

        Ok(Tensor::new(f32_vec_to_bytes(out), src.shape.clone(), DType::F32))
    }
}

/// Grouped-query self-attention with rotary positions and an optional sliding window.
pub struct Attention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    sliding_window: Option<usize>,
}

impl Attention {
    pub fn from_weights(config: &ModelConfig, q_proj: Linear, k_proj: Linear, v_proj: Linear, out_proj: Linear) -> Result<Self> {
        let head_dim = config.head_dim();
        let n_kv_heads = config.kv_heads();
        let check = |name: &str, lin: &Linear, out: usize, inp: usize| -> Result<()> {
            if lin.out_features() != out || lin.in_features() != inp {
                return Err(LoraForgeError::InvalidConfig(format!(
                    "{} weight is [{}, {}], config expects [{}, {}]",
                    name, lin.out_features(), lin.in_features(), out, inp
                )));
            }
            Ok(())
        };
        check("q_proj", &q_proj, config.n_heads * head_dim, config.dim)?;
        check("k_proj", &k_proj, n_kv_heads * head_dim, config.dim)?;
        check("v_proj", &v_proj, n_kv_heads * head_dim, config.dim)?;
        check("o_proj", &out_proj, config.dim, config.n_heads * head_dim)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            n_heads: config.n_heads,
            n_kv_heads,
            head_dim,
            sliding_window: config.sliding_window,
        })
    }

    pub fn forward_with_cache(&self, input: &Tensor, cache: &mut KVCache, layer_idx: usize, rope: &RopeFreqs) -> Result<Tensor> {
        if cache.head_dim() != self.head_dim || cache.num_kv_heads() != self.n_kv_heads {
            return Err(LoraForgeError::InvalidConfig(format!(
                "KVCache layout ({} heads x {}) does not match attention ({} heads x {})",
                cache.num_kv_heads(), cache.head_dim(), self.n_kv_heads, self.head_dim
            )));
        }

        let batch_size = input.shape()[0];
        let seq_len = input.shape()[1];
        let start = cache.current_len();

        // [B, S, H*D] -> [B, H, S, D]
        let q = self.q_proj.forward(input)?
            .reshape(&[batch_size, seq_len, self.n_heads, self.head_dim])?
            .transpose(1, 2)?;
        let k = self.k_proj.forward(input)?
            .reshape(&[batch_size, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose(1, 2)?;
        let v = self.v_proj.forward(input)?
            .reshape(&[batch_size, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose(1, 2)?;

        let q = rope.apply(&q, start)?;
        let k = rope.apply(&k, start)?;

        cache.update(layer_idx, &k, &v)?;
        let total_len = start + seq_len;
        let (k_full, v_full) = cache.get_view(layer_idx, total_len)?;

        let n_rep = self.n_heads / self.n_kv_heads;
        let k_full = k_full.repeat_kv(n_rep)?;
        let v_full = v_full.repeat_kv(n_rep)?;

        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let mut scores = q.batched_matmul(&k_full, true)?.mul_scalar(scale)?;

        let window_clips = self.sliding_window.is_some_and(|w| total_len > w);
        if seq_len > 1 || window_clips {
            scores = scores.add(&Tensor::causal_mask(seq_len, total_len, self.sliding_window))?;
        }

        let attn = scores.softmax_last()?;
        let context = attn.batched_matmul(&v_full, false)?
            .transpose(1, 2)?
            .reshape(&[batch_size, seq_len, self.n_heads * self.head_dim])?;

        self.out_proj.forward(&context)
    }
}

/// Per-layer key/value buffers [1, kv_heads, capacity, head_dim].
pub struct KVCache {
    past_keys: Vec<Tensor>,
    past_values: Vec<Tensor>,
    capacity: usize,
    current_len: usize,
    head_dim: usize,
    num_kv_heads: usize,
}

impl KVCache {
    pub fn new(num_layers: usize, capacity: usize, head_dim: usize, num_kv_heads: usize) -> Self {
        let shape = [1, num_kv_heads, capacity, head_dim];
        Self {
            past_keys: (0..num_layers).map(|_| Tensor::zeros(&shape)).collect(),
            past_values: (0..num_layers).map(|_| Tensor::zeros(&shape)).collect(),
            capacity,
            current_len: 0,
            head_dim,
            num_kv_heads,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Positions already committed by `advance`.
    pub fn current_len(&self) -> usize {
        self.current_len
    }

    /// Keys and values for positions `0..len`.
    pub fn get_view(&self, layer_idx: usize, len: usize) -> Result<(Tensor, Tensor)> {
        let (k, v) = self.layer(layer_idx)?;
        Ok((k.slice_sequence(0, len)?, v.slice_sequence(0, len)?))
    }

    /// Write `key`/`value` [1, kv_heads, s, D] at the current position.
    pub fn update(&mut self, layer_idx: usize, key: &Tensor, value: &Tensor) -> Result<()> {
        self.layer(layer_idx)?;
        let seq_len = key.shape()[2];
        if self.current_len + seq_len > self.capacity {
            return Err(LoraForgeError::SequenceLengthExceeded {
                max: self.capacity,
                actual: self.current_len + seq_len,
            });
        }
        self.past_keys[layer_idx].slice_assign_sequence(self.current_len, key)?;
        self.past_values[layer_idx].slice_assign_sequence(self.current_len, value)?;
        Ok(())
    }

    pub fn advance(&mut self, step: usize) {
        self.current_len += step;
    }

    /// Independent copy with its own buffers, for forking beams.
    pub fn deep_clone(&self) -> Result<Self> {
        let copy = |t: &Tensor| -> Result<Tensor> {
            Ok(Tensor::new(t.as_raw_bytes()?.to_vec(), t.shape.clone(), t.dtype()))
        };
        Ok(Self {
            past_keys: self.past_keys.iter().map(copy).collect::<Result<_>>()?,
            past_values: self.past_values.iter().map(copy).collect::<Result<_>>()?,
            capacity: self.capacity,
            current_len: self.current_len,
            head_dim: self.head_dim,
            num_kv_heads: self.num_kv_heads,
        })
    }

    fn layer(&self, layer_idx: usize) -> Result<(&Tensor, &Tensor)> {
        match (self.past_keys.get(layer_idx), self.past_values.get(layer_idx)) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(LoraForgeError::IndexOutOfBounds {
                index: layer_idx,
                dim: 0,
                size: self.past_keys.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_position_zero_is_identity() {
        let rope = RopeFreqs::new(4, 8, 10000.0);
        let x = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 1, 4]).unwrap();
        let y = rope.apply(&x, 0).unwrap();
        assert_eq!(y.as_slice_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rope_preserves_pair_norm() {
        let rope = RopeFreqs::new(4, 16, 10000.0);
        let x = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 1, 4]).unwrap();
        let y = rope.apply(&x, 5).unwrap();
        let out = y.as_slice_f32().unwrap();
        // Pairs are (x[0], x[2]) and (x[1], x[3]).
        assert!(((out[0] * out[0] + out[2] * out[2]) - 10.0).abs() < 1e-4);
        assert!(((out[1] * out[1] + out[3] * out[3]) - 20.0).abs() < 1e-4);
        assert!(rope.apply(&x, 16).is_err());
    }

    #[test]
    fn test_cache_overflow_and_deep_clone() {
        let mut cache = KVCache::new(1, 2, 2, 1);
        let kv = Tensor::from_f32(vec![1.0, 2.0], &[1, 1, 1, 2]).unwrap();
        cache.update(0, &kv, &kv).unwrap();
        cache.advance(1);

        let mut fork = cache.deep_clone().unwrap();
        assert_eq!(fork.current_len(), 1);
        let (fk, _) = fork.get_view(0, 1).unwrap();
        assert_eq!(fk.as_slice_f32().unwrap(), &[1.0, 2.0]);
        let other = Tensor::from_f32(vec![9.0, 9.0], &[1, 1, 1, 2]).unwrap();
        fork.update(0, &other, &other).unwrap();
        fork.advance(1);

        let (k, _) = cache.get_view(0, 2).unwrap();
        assert_eq!(k.as_slice_f32().unwrap(), &[1.0, 2.0, 0.0, 0.0]);
        assert!(matches!(
            fork.update(0, &kv, &kv),
            Err(LoraForgeError::SequenceLengthExceeded { max: 2, actual: 3 })
        ));
        assert!(cache.get_view(3, 1).is_err());
    }
}

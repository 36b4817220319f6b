use crate::error::{LoraForgeError, Result};
use super::tensor::{Tensor, f32_vec_to_bytes};
use super::dtype::DType;
use faer::linalg::matmul::matmul;
use faer::{mat, Parallelism};
use rayon::prelude::*;
use smallvec::{smallvec, SmallVec};

/// out[m, n] = lhs[m, k] @ rhs, where rhs is [k, n] or, if `rhs_transposed`, [n, k].
fn gemm(lhs: &[f32], rhs: &[f32], out: &mut [f32], m: usize, k: usize, n: usize, rhs_transposed: bool, par: Parallelism) {
    let a = mat::from_row_major_slice::<f32>(lhs, m, k);
    let b = if rhs_transposed {
        mat::from_row_major_slice::<f32>(rhs, n, k).transpose()
    } else {
        mat::from_row_major_slice::<f32>(rhs, k, n)
    };
    let c = mat::from_row_major_slice_mut::<f32>(out, m, n);
    matmul(c, a, b, None, 1.0, par);
}

#[allow(non_snake_case)]
impl Tensor {
    /// [..., K] @ [K, N] -> [..., N]. Leading dims of the LHS are collapsed into M.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        self.matmul_impl(other, false)
    }

    /// [..., K] @ [N, K]ᵀ -> [..., N]. This is the `x · Wᵀ` of a linear layer
    /// with a row-major [out, in] weight, without materializing the transpose.
    pub fn matmul_transposed(&self, other: &Tensor) -> Result<Tensor> {
        self.matmul_impl(other, true)
    }

    fn matmul_impl(&self, other: &Tensor, rhs_transposed: bool) -> Result<Tensor> {
        let ndim = self.shape.len();
        if ndim < 1 || other.shape.len() != 2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![2],
                actual: vec![ndim, other.shape.len()],
            });
        }

        let K = self.shape[ndim - 1];
        let M: usize = self.shape[..ndim - 1].iter().product();
        let (K2, N) = if rhs_transposed {
            (other.shape[1], other.shape[0])
        } else {
            (other.shape[0], other.shape[1])
        };
        if K != K2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![M, K],
                actual: other.shape.to_vec(),
            });
        }

        let lhs = self.contiguous()?;
        let rhs = other.to_f32()?.contiguous()?;
        let lhs_data = lhs.as_slice_f32()?;
        let rhs_data = rhs.as_slice_f32()?;

        let mut out_data = vec![0.0f32; M * N];
        gemm(lhs_data, rhs_data, &mut out_data, M, K, N, rhs_transposed, faer::get_global_parallelism());

        let mut out_shape: SmallVec<[usize; 4]> = SmallVec::from_slice(&self.shape[..ndim - 1]);
        out_shape.push(N);
        Ok(Tensor::new(f32_vec_to_bytes(out_data), out_shape, DType::F32))
    }

    /// Batched matmul over all leading dims:
    /// [..., M, K] @ [..., K, N] -> [..., M, N], or with `rhs_transposed`
    /// [..., M, K] @ [..., N, K]ᵀ -> [..., M, N].
    pub fn batched_matmul(&self, other: &Tensor, rhs_transposed: bool) -> Result<Tensor> {
        let ndim = self.shape.len();
        if ndim != other.shape.len() || ndim < 3 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![3],
                actual: vec![ndim, other.shape.len()],
            });
        }

        let batch_dims = ndim - 2;
        if self.shape[..batch_dims] != other.shape[..batch_dims] {
            return Err(LoraForgeError::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: other.shape.to_vec(),
            });
        }

        let M = self.shape[ndim - 2];
        let K = self.shape[ndim - 1];
        let (K2, N) = if rhs_transposed {
            (other.shape[ndim - 1], other.shape[ndim - 2])
        } else {
            (other.shape[ndim - 2], other.shape[ndim - 1])
        };
        if K != K2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![M, K],
                actual: vec![K2, N],
            });
        }

        let batch_count: usize = self.shape[..batch_dims].iter().product();
        let lhs = self.contiguous()?;
        let rhs = other.contiguous()?;
        let lhs_data = lhs.as_slice_f32()?;
        let rhs_data = rhs.as_slice_f32()?;

        let mut out_data = vec![0.0f32; batch_count * M * N];
        if M * N > 0 {
            // Parallelize over batches/heads; each product runs single-threaded.
            out_data.par_chunks_mut(M * N)
                .zip(lhs_data.par_chunks(M * K))
                .zip(rhs_data.par_chunks(K * N))
                .for_each(|((out_chunk, lhs_chunk), rhs_chunk)| {
                    gemm(lhs_chunk, rhs_chunk, out_chunk, M, K, N, rhs_transposed, Parallelism::None);
                });
        }

        let mut out_shape: SmallVec<[usize; 4]> = SmallVec::from_slice(&self.shape[..batch_dims]);
        out_shape.push(M);
        out_shape.push(N);
        Ok(Tensor::new(f32_vec_to_bytes(out_data), out_shape, DType::F32))
    }

    fn zip_broadcast(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        let lhs = self.contiguous()?;
        let rhs = other.contiguous()?;
        let lhs_data = lhs.as_slice_f32()?;
        let rhs_data = rhs.as_slice_f32()?;
        let lhs_len = lhs_data.len();
        let rhs_len = rhs_data.len();

        let out_data: Vec<f32> = if lhs_len == rhs_len {
            lhs_data.iter().zip(rhs_data.iter()).map(|(&a, &b)| f(a, b)).collect()
        } else if rhs_len > 0 && lhs_len % rhs_len == 0 && is_valid_broadcast(&self.shape, &other.shape) {
            // rhs is a trailing-dims suffix; repeat it
            lhs_data.iter().enumerate().map(|(i, &a)| f(a, rhs_data[i % rhs_len])).collect()
        } else {
            return Err(LoraForgeError::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: other.shape.to_vec(),
            });
        };

        Ok(Tensor::new(f32_vec_to_bytes(out_data), self.shape.clone(), DType::F32))
    }

    fn map_f32(&self, f: impl Fn(f32) -> f32) -> Result<Tensor> {
        let src = self.contiguous()?;
        let out: Vec<f32> = src.as_slice_f32()?.iter().map(|&x| f(x)).collect();
        Ok(Tensor::new(f32_vec_to_bytes(out), self.shape.clone(), DType::F32))
    }

    // Element-wise addition with broadcasting of a trailing-dims suffix
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_broadcast(other, |a, b| a + b)
    }

    // Element-wise multiplication with broadcasting of a trailing-dims suffix
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_broadcast(other, |a, b| a * b)
    }

    pub fn mul_scalar(&self, scalar: f32) -> Result<Tensor> {
        self.map_f32(|x| x * scalar)
    }

    // SiLU activation: x * sigmoid(x)
    pub fn silu(&self) -> Result<Tensor> {
        self.map_f32(|x| x / (1.0 + (-x).exp()))
    }

    /// RMSNorm: x * weight / rms(x), where rms(x) = sqrt(mean(x^2) + eps).
    pub fn rms_norm(&self, weight: &Tensor, eps: f32) -> Result<Tensor> {
        if self.shape.is_empty() {
            return Err(LoraForgeError::ShapeMismatch { expected: vec![1], actual: vec![] });
        }
        let last_dim = self.shape[self.shape.len() - 1];

        let src = self.contiguous()?;
        let input = src.as_slice_f32()?;
        let gamma = weight.as_slice_f32()?;

        if gamma.len() != last_dim {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![last_dim],
                actual: vec![gamma.len()],
            });
        }

        let mut out_data = vec![0.0f32; input.len()];
        out_data.par_chunks_mut(last_dim)
            .zip(input.par_chunks(last_dim))
            .for_each(|(out_row, row)| {
                let sum_sq: f32 = row.iter().map(|&x| x * x).sum();
                let inv_rms = 1.0 / (sum_sq / last_dim as f32 + eps).sqrt();
                for j in 0..last_dim {
                    out_row[j] = row[j] * inv_rms * gamma[j];
                }
            });

        Ok(Tensor::new(f32_vec_to_bytes(out_data), self.shape.clone(), DType::F32))
    }

    // Softmax along the last dimension
    pub fn softmax_last(&self) -> Result<Tensor> {
        if self.shape.is_empty() {
            return Err(LoraForgeError::ShapeMismatch { expected: vec![1], actual: vec![] });
        }
        let last_dim_size = self.shape[self.shape.len() - 1];
        let src = self.contiguous()?;
        let input_data = src.as_slice_f32()?;

        let mut out_data = vec![0.0f32; input_data.len()];
        out_data.par_chunks_mut(last_dim_size)
            .zip(input_data.par_chunks(last_dim_size))
            .for_each(|(out_row, in_row)| {
                // Max for numerical stability
                let max_val = in_row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                if max_val == f32::NEG_INFINITY {
                    // Fully masked row
                    out_row.iter_mut().for_each(|v| *v = 0.0);
                    return;
                }
                let mut sum_exp = 0.0;
                for (o, &val) in out_row.iter_mut().zip(in_row.iter()) {
                    *o = (val - max_val).exp();
                    sum_exp += *o;
                }
                for val in out_row.iter_mut() {
                    *val /= sum_exp;
                }
            });

        Ok(Tensor::new(f32_vec_to_bytes(out_data), self.shape.clone(), DType::F32))
    }

    /// Repeat KV heads for GQA: [B, n_kv_heads, S, D] -> [B, n_kv_heads*n_rep, S, D]
    pub fn repeat_kv(&self, n_rep: usize) -> Result<Tensor> {
        if n_rep == 1 {
            return Ok(self.clone());
        }
        if self.shape.len() != 4 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![4],
                actual: vec![self.shape.len()],
            });
        }

        let (batch, n_kv_heads, seq_len, head_dim) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let x = self.contiguous()?;
        let input_data = x.as_slice_f32()?;
        let out_heads = n_kv_heads * n_rep;
        let mut out_data = Vec::with_capacity(batch * out_heads * seq_len * head_dim);

        let head_size = seq_len * head_dim;
        for b in 0..batch {
            for h in 0..n_kv_heads {
                let start = (b * n_kv_heads + h) * head_size;
                let head_data = &input_data[start..start + head_size];
                for _ in 0..n_rep {
                    out_data.extend_from_slice(head_data);
                }
            }
        }

        Ok(Tensor::new(f32_vec_to_bytes(out_data), smallvec![batch, out_heads, seq_len, head_dim], DType::F32))
    }

    /// Additive attention mask [1, 1, seq_len, total_len] for queries at
    /// absolute positions `total_len - seq_len ..`. Key j is visible to query
    /// position p when `j <= p` and, with a sliding window w, `p - j < w`.
    pub fn causal_mask(seq_len: usize, total_len: usize, sliding_window: Option<usize>) -> Tensor {
        let offset = total_len - seq_len;
        let mut data = Vec::with_capacity(seq_len * total_len);
        for i in 0..seq_len {
            let p = i + offset;
            for j in 0..total_len {
                let visible = j <= p && sliding_window.map_or(true, |w| p - j < w);
                data.push(if visible { 0.0f32 } else { f32::NEG_INFINITY });
            }
        }
        Tensor::new(f32_vec_to_bytes(data), smallvec![1usize, 1, seq_len, total_len], DType::F32)
    }
}

/// Check that rhs, after dropping leading 1s, equals the trailing dims of lhs.
fn is_valid_broadcast(lhs_shape: &[usize], rhs_shape: &[usize]) -> bool {
    let start = rhs_shape.iter().take_while(|&&r| r == 1).count();
    let core = &rhs_shape[start..];
    core.len() <= lhs_shape.len() && lhs_shape.ends_with(core)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_f32(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_matmul_2d() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.as_slice_f32().unwrap(), &[4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matmul_transposed_matches_explicit() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 2, 3]);
        let w = t(&[1.0, 0.0, -1.0, 0.5, 0.5, 0.5], &[2, 3]); // [out, in]
        let y = x.matmul_transposed(&w).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2]);
        assert_eq!(y.as_slice_f32().unwrap(), &[-2.0, 3.0, -2.0, 7.5]);
    }

    #[test]
    fn test_batched_matmul_transposed() {
        let q = t(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let k = t(&[2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[1, 1, 3, 2]);
        let s = q.batched_matmul(&k, true).unwrap();
        assert_eq!(s.shape(), &[1, 1, 2, 3]);
        assert_eq!(s.as_slice_f32().unwrap(), &[2.0, 4.0, 6.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_rms_norm_unit_weight() {
        let x = t(&[3.0, 4.0], &[1, 2]);
        let w = t(&[1.0, 1.0], &[2]);
        let y = x.rms_norm(&w, 0.0).unwrap();
        let rms = (12.5f32).sqrt();
        let out = y.as_slice_f32().unwrap();
        assert!((out[0] - 3.0 / rms).abs() < 1e-6);
        assert!((out[1] - 4.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_masked_row() {
        let x = t(&[0.0, f32::NEG_INFINITY, 1.0, 1.0], &[2, 2]);
        let y = x.softmax_last().unwrap();
        let out = y.as_slice_f32().unwrap();
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_causal_mask_sliding_window() {
        let m = Tensor::causal_mask(1, 4, Some(2));
        let out = m.as_slice_f32().unwrap();
        // query at position 3 sees keys 2 and 3 only
        assert_eq!(out[0], f32::NEG_INFINITY);
        assert_eq!(out[1], f32::NEG_INFINITY);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);

        let full = Tensor::causal_mask(2, 2, None);
        assert_eq!(full.as_slice_f32().unwrap(), &[0.0, f32::NEG_INFINITY, 0.0, 0.0]);
    }

    #[test]
    fn test_repeat_kv() {
        let x = t(&[1.0, 2.0], &[1, 1, 1, 2]);
        let y = x.repeat_kv(3).unwrap();
        assert_eq!(y.shape(), &[1, 3, 1, 2]);
        assert_eq!(y.as_slice_f32().unwrap(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_add_broadcast_bias() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&[10.0, 20.0], &[2]);
        assert_eq!(x.add(&b).unwrap().as_slice_f32().unwrap(), &[11.0, 22.0, 13.0, 24.0]);
        let bad = t(&[1.0, 2.0, 3.0], &[3]);
        assert!(x.add(&bad).is_err());
    }
}

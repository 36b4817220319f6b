use crate::error::{LoraForgeError, Result};
use super::tensor::{Tensor, Storage, f32_vec_to_bytes};
use super::dtype::DType;
use smallvec::SmallVec;
use std::sync::Arc;

impl Tensor {
    // Reshape tensor view
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = shape.iter().product();

        if current_size != new_size {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![current_size],
                actual: vec![new_size],
            });
        }

        let new_strides = Self::compute_strides(shape);
        if self.is_contiguous() {
            Self::view(self.data.clone(), SmallVec::from_slice(shape), new_strides, self.dtype)
        } else {
            let contiguous = self.contiguous()?;
            Self::view(contiguous.data, SmallVec::from_slice(shape), new_strides, self.dtype)
        }
    }

    // Transpose two dimensions
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        let ndim = self.shape.len();
        if dim0 >= ndim || dim1 >= ndim {
            return Err(LoraForgeError::IndexOutOfBounds {
                index: std::cmp::max(dim0, dim1),
                dim: 0,
                size: ndim,
            });
        }

        let mut new_shape = self.shape.clone();
        let mut new_strides = self.strides.clone();
        new_shape.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);

        Self::view(self.data.clone(), new_shape, new_strides, self.dtype)
    }

    /// Materialize the logical layout into fresh row-major storage.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }

        let size = self.element_count();
        let elem_size = self.dtype.size();
        let src = self.as_raw_bytes()?;
        let mut data: Vec<u8> = Vec::with_capacity(size * elem_size);

        // Odometer over the logical index space.
        let ndim = self.shape.len();
        let mut index = vec![0usize; ndim];
        for _ in 0..size {
            let offset: usize = index.iter().zip(self.strides.iter()).map(|(&i, &s)| i * s).sum();
            let start = offset * elem_size;
            data.extend_from_slice(&src[start..start + elem_size]);

            for d in (0..ndim).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        Ok(Tensor::new(data, self.shape.clone(), self.dtype))
    }

    /// Copy positions `start..end` of dim 2 from a [B, H, S, D] tensor.
    pub fn slice_sequence(&self, start: usize, end: usize) -> Result<Tensor> {
        if self.shape.len() != 4 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![4],
                actual: self.shape.to_vec(),
            });
        }

        let (batch, heads, seq_len, head_dim) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        if end > seq_len || start > end {
            return Err(LoraForgeError::IndexOutOfBounds {
                index: end,
                dim: 2,
                size: seq_len,
            });
        }

        let new_seq_len = end - start;
        let src_data = self.as_slice_f32()?;
        let mut dest_data = Vec::with_capacity(batch * heads * new_seq_len * head_dim);

        let (stride_b, stride_h, stride_s) = (self.strides[0], self.strides[1], self.strides[2]);
        for b in 0..batch {
            for h in 0..heads {
                for s in 0..new_seq_len {
                    let src_idx = b * stride_b + h * stride_h + (start + s) * stride_s;
                    dest_data.extend_from_slice(&src_data[src_idx..src_idx + head_dim]);
                }
            }
        }

        Ok(Self::new(f32_vec_to_bytes(dest_data), smallvec::smallvec![batch, heads, new_seq_len, head_dim], DType::F32))
    }

    /// Write `source` [B, H, s, D] into positions `start..start+s` of dim 2.
    /// The destination must be uniquely owned, contiguous F32 storage.
    pub fn slice_assign_sequence(&mut self, start: usize, source: &Tensor) -> Result<()> {
        if self.shape.len() != 4 || source.shape.len() != 4 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![4],
                actual: source.shape.to_vec(),
            });
        }

        let seq_len_src = source.shape[2];
        if start + seq_len_src > self.shape[2] {
            return Err(LoraForgeError::IndexOutOfBounds {
                index: start + seq_len_src,
                dim: 2,
                size: self.shape[2],
            });
        }

        if self.shape[0] != source.shape[0] || self.shape[1] != source.shape[1] || self.shape[3] != source.shape[3] {
            return Err(LoraForgeError::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: source.shape.to_vec(),
            });
        }

        let source = source.contiguous()?;
        let src_data = source.as_slice_f32()?;
        let head_dim = self.shape[3];
        let (stride_b, stride_h, stride_s) = (self.strides[0], self.strides[1], self.strides[2]);
        let (src_b, src_h) = (source.strides[0], source.strides[1]);
        let (batch, heads) = (self.shape[0], self.shape[1]);

        let dest = match Arc::get_mut(&mut self.data) {
            Some(Storage::Owned(vec)) => bytemuck::try_cast_slice_mut::<u8, f32>(vec.as_mut_slice())
                .map_err(|_| LoraForgeError::InvalidConfig("cache buffer not 4-byte aligned".into()))?,
            _ => return Err(LoraForgeError::NotImplemented("Cannot mutate shared or mmap tensor".into())),
        };

        for b in 0..batch {
            for h in 0..heads {
                for s in 0..seq_len_src {
                    let dest_idx = b * stride_b + h * stride_h + (start + s) * stride_s;
                    let src_idx = b * src_b + h * src_h + s * head_dim;
                    dest[dest_idx..dest_idx + head_dim]
                        .copy_from_slice(&src_data[src_idx..src_idx + head_dim]);
                }
            }
        }

        Ok(())
    }
}

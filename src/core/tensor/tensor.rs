use crate::error::{LoraForgeError, Result};
use super::dtype::{DType, Shape};
use std::sync::Arc;
use std::fmt;
use half::{bf16, f16};
use smallvec::SmallVec;

/// Convert a Vec<f32> into a Vec<u8>, reusing the allocation when possible.
pub fn f32_vec_to_bytes(v: Vec<f32>) -> Vec<u8> {
    match bytemuck::try_cast_vec::<f32, u8>(v) {
        Ok(bytes) => bytes,
        Err((_, original)) => bytemuck::cast_slice::<f32, u8>(&original).to_vec(),
    }
}

pub enum Storage {
    Owned(Vec<u8>),
    MMap { mmap: Arc<memmap2::Mmap>, offset: usize, len: usize },
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
            Storage::MMap { offset, len, .. } => write!(f, "MMap(offset={}, len={})", offset, len),
        }
    }
}

impl Storage {
    fn byte_len(&self) -> usize {
        match self {
            Storage::Owned(v) => v.len(),
            Storage::MMap { len, .. } => *len,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::MMap { mmap, offset, len } => &mmap[*offset..*offset + *len],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tensor {
    pub(crate) data: Arc<Storage>, // Arc for cheap cloning
    pub(crate) shape: Shape,
    pub(crate) strides: Shape,
    pub(crate) dtype: DType,
}

impl Tensor {
    pub fn new(data: Vec<u8>, shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape: Shape = shape.into();
        let strides = Self::compute_strides(&shape);
        Self {
            data: Arc::new(Storage::Owned(data)),
            shape,
            strides,
            dtype,
        }
    }

    /// Build an F32 tensor from values. Panics-free: a length mismatch is an error.
    pub fn from_f32(values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(LoraForgeError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![values.len()],
            });
        }
        Ok(Self::new(f32_vec_to_bytes(values), SmallVec::from_slice(shape), DType::F32))
    }

    pub fn from_mmap(mmap: Arc<memmap2::Mmap>, offset: usize, len: usize, shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape: Shape = shape.into();
        let strides = Self::compute_strides(&shape);
        Self {
            data: Arc::new(Storage::MMap { mmap, offset, len }),
            shape,
            strides,
            dtype,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    // Create a view with new shape/strides over existing data.
    // Validates that the maximum addressable offset fits within the storage.
    pub(crate) fn view(data: Arc<Storage>, shape: Shape, strides: Shape, dtype: DType) -> Result<Self> {
        if !shape.is_empty() && shape.iter().all(|&s| s > 0) {
            let max_offset: usize = shape.iter().zip(strides.iter())
                .map(|(&s, &st)| (s - 1) * st)
                .sum();
            let required_bytes = (max_offset + 1) * dtype.size();
            let available = data.byte_len();
            if required_bytes > available {
                return Err(LoraForgeError::IndexOutOfBounds {
                    index: required_bytes,
                    dim: 0,
                    size: available,
                });
            }
        }
        Ok(Self { data, shape, strides, dtype })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let size: usize = shape.iter().product();
        let bytes = vec![0u8; size * DType::F32.size()];
        Self::new(bytes, SmallVec::from_slice(shape), DType::F32)
    }

    pub(crate) fn compute_strides(shape: &[usize]) -> Shape {
        let mut strides: Shape = smallvec::smallvec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == Self::compute_strides(&self.shape)
    }

    /// Borrow the data as f32. Requires F32 dtype and 4-byte alignment;
    /// call `to_f32()` first for mmap-backed or half-precision tensors.
    pub fn as_slice_f32(&self) -> Result<&[f32]> {
        if self.dtype != DType::F32 {
            return Err(LoraForgeError::DTypeMismatch);
        }
        let bytes = self.as_raw_bytes()?;
        bytemuck::try_cast_slice(bytes).map_err(|_| {
            LoraForgeError::InvalidConfig(
                "as_slice_f32: data not 4-byte aligned; call to_f32() first to make an aligned copy".into()
            )
        })
    }

    /// Returns the raw byte slice of the backing storage.
    pub fn as_raw_bytes(&self) -> Result<&[u8]> {
        Ok(self.data.bytes())
    }

    /// Contiguous f32 copy of the logical contents, in row-major order.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        let t = self.to_f32()?.contiguous()?;
        Ok(t.as_slice_f32()?.to_vec())
    }

    /// Convert to an aligned F32 tensor.
    pub fn to_f32(&self) -> Result<Tensor> {
        match self.dtype {
            DType::F32 => {
                // Mmap offsets are not always 4-byte aligned; copy in that case
                // so as_slice_f32() never sees an unaligned pointer.
                let bytes = self.as_raw_bytes()?;
                if bytemuck::try_cast_slice::<u8, f32>(bytes).is_ok() {
                    Ok(self.clone())
                } else {
                    let data_f32: Vec<f32> = bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    Ok(Tensor {
                        data: Arc::new(Storage::Owned(f32_vec_to_bytes(data_f32))),
                        shape: self.shape.clone(),
                        strides: self.strides.clone(),
                        dtype: DType::F32,
                    })
                }
            }
            DType::BF16 | DType::F16 => {
                let contiguous = self.contiguous()?;
                let bytes = contiguous.as_raw_bytes()?;
                let widen: fn([u8; 2]) -> f32 = if self.dtype == DType::BF16 {
                    |b| bf16::from_le_bytes(b).to_f32()
                } else {
                    |b| f16::from_le_bytes(b).to_f32()
                };
                let data_f32: Vec<f32> = bytes
                    .chunks_exact(2)
                    .map(|c| widen([c[0], c[1]]))
                    .collect();
                Ok(Tensor::new(f32_vec_to_bytes(data_f32), contiguous.shape.clone(), DType::F32))
            }
            DType::U8 => Err(LoraForgeError::NotImplemented("Conversion from U8 to F32".into())),
        }
    }

    /// Narrow an F32 tensor to BF16 storage (used when exporting state dicts).
    pub fn to_bf16(&self) -> Result<Tensor> {
        let values = self.to_vec_f32()?;
        let halves: Vec<bf16> = values.into_iter().map(bf16::from_f32).collect();
        let bytes = bytemuck::cast_slice::<bf16, u8>(&halves).to_vec();
        Ok(Tensor::new(bytes, self.shape.clone(), DType::BF16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_row_major() {
        let s = Tensor::compute_strides(&[2, 3, 4]);
        assert_eq!(s.as_slice(), &[12, 4, 1]);
        assert!(Tensor::compute_strides(&[]).is_empty());
    }

    #[test]
    fn test_from_f32_checks_len() {
        assert!(Tensor::from_f32(vec![1.0, 2.0], &[3]).is_err());
        let t = Tensor::from_f32(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        assert_eq!(t.as_slice_f32().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_bf16_roundtrip_exact_values() {
        let t = Tensor::from_f32(vec![1.0, -2.5, 0.0, 1024.0], &[2, 2]).unwrap();
        let back = t.to_bf16().unwrap().to_f32().unwrap();
        assert_eq!(back.shape(), &[2, 2]);
        assert_eq!(back.as_slice_f32().unwrap(), &[1.0, -2.5, 0.0, 1024.0]);
    }
}

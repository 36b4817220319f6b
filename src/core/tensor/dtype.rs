use half::{bf16, f16};
use serde::Deserialize;
use smallvec::SmallVec;

/// Shape type: stack-allocated for ≤4 dimensions (covers most tensor shapes),
/// spills to heap for higher dimensionality.
pub type Shape = SmallVec<[usize; 4]>;

/// Storage element type. 4-bit weights live in `QuantizedTensor`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    U8,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::U8 => 1,
        }
    }
}

/// Precision that matmul operands are rounded to before accumulation.
/// Accumulation itself always happens in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    F32,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float16")]
    F16,
}

impl ComputeDType {
    #[inline]
    pub fn round(&self, x: f32) -> f32 {
        match self {
            ComputeDType::F32 => x,
            ComputeDType::BF16 => bf16::from_f32(x).to_f32(),
            ComputeDType::F16 => f16::from_f32(x).to_f32(),
        }
    }
}

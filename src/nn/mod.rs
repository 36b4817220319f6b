use crate::adapter::LoraAdapter;
use crate::config::{ComputeDType, QuantizationConfig};
use crate::core::tensor::{f32_vec_to_bytes, DType, Tensor};
use crate::error::{LoraForgeError, Result};
use crate::quantization::{self, QuantizedTensor};
use half::{bf16, f16};

pub trait Layer {
    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

/// Layers whose base parameters can be excluded from updates.
pub trait Freezable {
    fn is_frozen(&self) -> bool;
    fn freeze(&mut self);
    fn unfreeze(&mut self);
}

/// Base weight of a linear projection, row-major [out, in].
#[derive(Debug, Clone)]
pub enum LinearWeight {
    Dense(Tensor),
    Quantized(QuantizedTensor),
}

impl LinearWeight {
    pub fn shape(&self) -> &[usize] {
        match self {
            LinearWeight::Dense(t) => t.shape(),
            LinearWeight::Quantized(q) => q.shape(),
        }
    }

    /// Full-precision copy of the base weight.
    pub fn to_dense(&self) -> Result<Tensor> {
        match self {
            LinearWeight::Dense(t) => Ok(t.clone()),
            LinearWeight::Quantized(q) => quantization::dequantize(q),
        }
    }
}

pub struct Linear {
    pub weight: LinearWeight,
    pub bias: Option<Tensor>,
    pub lora: Option<LoraAdapter>,
    pub compute_dtype: ComputeDType,
    pub frozen: bool,
}

impl Linear {
    /// Build from a loaded [out, in] weight. The weight is widened to F32.
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.shape().len() != 2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![2],
                actual: weight.shape().to_vec(),
            });
        }
        let bias = bias.map(|b| b.to_f32()).transpose()?;
        Ok(Self {
            weight: LinearWeight::Dense(weight.to_f32()?),
            bias,
            lora: None,
            compute_dtype: ComputeDType::F32,
            frozen: false,
        })
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Replace the dense weight with its 4-bit form. A no-op when already quantized.
    pub fn quantize(&mut self, config: &QuantizationConfig) -> Result<()> {
        if let LinearWeight::Dense(w) = &self.weight {
            let q = quantization::quantize_4bit(w, config)?;
            self.weight = LinearWeight::Quantized(q);
            self.compute_dtype = config.compute_dtype;
            self.frozen = true;
        }
        Ok(())
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, LinearWeight::Quantized(_))
    }

    /// Swap the base weight for a fine-tuned copy of the same shape, kept in full precision.
    pub fn replace_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.shape() != self.weight.shape() {
            return Err(LoraForgeError::AdapterMismatch(format!(
                "replacement weight {:?} does not match layer {:?}", weight.shape(), self.weight.shape()
            )));
        }
        self.weight = LinearWeight::Dense(weight.to_f32()?);
        self.compute_dtype = ComputeDType::F32;
        Ok(())
    }

    /// Attach a low-rank update. Shapes must line up with the base weight.
    pub fn attach_lora(&mut self, adapter: LoraAdapter) -> Result<()> {
        if adapter.in_features() != self.in_features() || adapter.out_features() != self.out_features() {
            return Err(LoraForgeError::AdapterMismatch(format!(
                "adapter [{} -> {}] does not fit layer [{} -> {}]",
                adapter.in_features(), adapter.out_features(),
                self.in_features(), self.out_features()
            )));
        }
        self.lora = Some(adapter);
        Ok(())
    }

    pub fn has_lora(&self) -> bool {
        self.lora.is_some()
    }

    /// Base weight with the low-rank update folded in: `W + scaling · B·A`.
    pub fn merged_weight(&self) -> Result<Tensor> {
        let base = self.weight.to_dense()?;
        match &self.lora {
            Some(lora) => base.add(&lora.delta_weight()?),
            None => Ok(base),
        }
    }
}

impl Freezable for Linear {
    fn is_frozen(&self) -> bool { self.frozen }
    fn freeze(&mut self) { self.frozen = true; }
    fn unfreeze(&mut self) { self.frozen = false; }
}

impl Layer for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        // Input: [..., In], weight: [Out, In], output: [..., Out]
        let mut output = match &self.weight {
            LinearWeight::Dense(w) => input.matmul_transposed(w)?,
            LinearWeight::Quantized(q) => quantization::quantized_matmul(input, q, self.compute_dtype)?,
        };

        if let Some(lora) = &self.lora {
            output = output.add(&lora.forward(input)?)?;
        }

        match &self.bias {
            Some(b) => output.add(b),
            None => Ok(output),
        }
    }
}

/// Token embedding table [vocab, dim]. Rows are read in the stored dtype.
pub struct Embedding {
    pub weight: Tensor,
    pub num_embeddings: usize,
    pub embedding_dim: usize,
}

impl Embedding {
    pub fn from_weights(weight: Tensor) -> Result<Self> {
        if weight.shape().len() != 2 {
            return Err(LoraForgeError::ShapeMismatch {
                expected: vec![2],
                actual: weight.shape().to_vec(),
            });
        }
        let weight = weight.contiguous()?;
        let num_embeddings = weight.shape()[0];
        let embedding_dim = weight.shape()[1];
        Ok(Self { weight, num_embeddings, embedding_dim })
    }

    /// Look up `ids`, producing [1, ids.len(), dim].
    pub fn forward(&self, ids: &[u32]) -> Result<Tensor> {
        let d_model = self.embedding_dim;
        let elem = self.weight.dtype().size();
        let bytes = self.weight.as_raw_bytes()?;
        let mut out_data = Vec::with_capacity(ids.len() * d_model);

        for &id in ids {
            let idx = id as usize;
            if idx >= self.num_embeddings {
                return Err(LoraForgeError::IndexOutOfBounds {
                    index: idx,
                    dim: 0,
                    size: self.num_embeddings,
                });
            }
            let row = &bytes[idx * d_model * elem..(idx + 1) * d_model * elem];
            match self.weight.dtype() {
                DType::F32 => out_data.extend(row.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
                DType::BF16 => out_data.extend(row.chunks_exact(2).map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())),
                DType::F16 => out_data.extend(row.chunks_exact(2).map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())),
                DType::U8 => return Err(LoraForgeError::DTypeMismatch),
            }
        }

        Ok(Tensor::new(f32_vec_to_bytes(out_data), vec![1, ids.len(), d_model], DType::F32))
    }
}

/// Root-mean-square normalization with a learned scale.
pub struct RmsNorm {
    pub weight: Tensor,
    pub eps: f32,
}

impl RmsNorm {
    pub fn from_weights(weight: Tensor, eps: f32) -> Result<Self> {
        Ok(Self { weight: weight.to_f32()?, eps })
    }
}

impl Layer for RmsNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        input.rms_norm(&self.weight, self.eps)
    }
}

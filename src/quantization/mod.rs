//! Blockwise 4-bit weight quantization (NF4 / FP4) with optional double
//! quantization of the per-block scales.
//!
//! Layout: two 4-bit codes per byte, first element in the high nibble.
//! Each `block_size` run of elements shares one absmax scale; a code decodes
//! to `codebook[code] * absmax[block]`. With double quantization the absmax
//! values are centred on their mean and stored as i8 in groups of
//! `double_quant_block_size`, one f32 scale per group.

use crate::config::{ComputeDType, QuantType, QuantizationConfig};
use crate::core::tensor::{Tensor, f32_vec_to_bytes, DType};
use crate::error::{LoraForgeError, Result};
use rayon::prelude::*;
use std::time::Instant;

/// NormalFloat-4 codebook: quantiles of N(0, 1) normalized to [-1, 1], with an exact zero.
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// FP4 (e2m1) codebook normalized to [-1, 1]; codes 8..15 are the negatives of 0..7.
pub const FP4_CODEBOOK: [f32; 16] = [
    0.0,
    0.005_208_333,
    0.666_666_7,
    1.0,
    0.333_333_34,
    0.5,
    0.166_666_67,
    0.25,
    -0.0,
    -0.005_208_333,
    -0.666_666_7,
    -1.0,
    -0.333_333_34,
    -0.5,
    -0.166_666_67,
    -0.25,
];

fn codebook(quant_type: QuantType) -> &'static [f32; 16] {
    match quant_type {
        QuantType::Nf4 => &NF4_CODEBOOK,
        QuantType::Fp4 => &FP4_CODEBOOK,
    }
}

/// Nearest-code lookup: codebook values sorted ascending with midpoints between neighbours.
struct CodeSearch {
    codes: [u8; 16],
    midpoints: [f32; 15],
}

impl CodeSearch {
    fn new(book: &[f32; 16]) -> Self {
        let mut order: Vec<usize> = (0..16).collect();
        order.sort_by(|&a, &b| book[a].total_cmp(&book[b]));
        let mut codes = [0u8; 16];
        let mut midpoints = [0.0f32; 15];
        for (i, &idx) in order.iter().enumerate() {
            codes[i] = idx as u8;
            if i > 0 {
                midpoints[i - 1] = 0.5 * (book[order[i - 1]] + book[idx]);
            }
        }
        Self { codes, midpoints }
    }

    #[inline]
    fn nearest(&self, x: f32) -> u8 {
        self.codes[self.midpoints.partition_point(|&m| m < x)]
    }
}

/// Per-block scales, either plain or second-level quantized.
#[derive(Debug, Clone)]
pub enum BlockScales {
    Full(Vec<f32>),
    Double {
        codes: Vec<i8>,
        group_scales: Vec<f32>,
        offset: f32,
        group_size: usize,
    },
}

impl BlockScales {
    fn double_quantize(absmax: &[f32], group_size: usize) -> Self {
        let offset = if absmax.is_empty() {
            0.0
        } else {
            absmax.iter().sum::<f32>() / absmax.len() as f32
        };
        let mut codes = vec![0i8; absmax.len()];
        let group_scales: Vec<f32> = codes
            .par_chunks_mut(group_size)
            .zip(absmax.par_chunks(group_size))
            .map(|(out, group)| {
                let amax = group.iter().fold(0.0f32, |acc, &a| acc.max((a - offset).abs()));
                let scale = if amax == 0.0 { 0.0 } else { amax / 127.0 };
                let inv = if scale == 0.0 { 0.0 } else { 1.0 / scale };
                for (o, &a) in out.iter_mut().zip(group) {
                    *o = ((a - offset) * inv).round().clamp(-127.0, 127.0) as i8;
                }
                scale
            })
            .collect();
        BlockScales::Double { codes, group_scales, offset, group_size }
    }

    /// Scale of block `b`.
    #[inline]
    pub fn get(&self, b: usize) -> f32 {
        match self {
            BlockScales::Full(v) => v[b],
            BlockScales::Double { codes, group_scales, offset, group_size } => {
                codes[b] as f32 * group_scales[b / group_size] + offset
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockScales::Full(v) => v.len(),
            BlockScales::Double { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage_bytes(&self) -> usize {
        match self {
            BlockScales::Full(v) => v.len() * 4,
            BlockScales::Double { codes, group_scales, .. } => codes.len() + group_scales.len() * 4 + 4,
        }
    }
}

/// A 4-bit quantized weight matrix.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    shape: Vec<usize>,
    quant_type: QuantType,
    block_size: usize,
    packed: Vec<u8>,
    scales: BlockScales,
}

impl QuantizedTensor {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn scales(&self) -> &BlockScales {
        &self.scales
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes held by codes and scales.
    pub fn storage_bytes(&self) -> usize {
        self.packed.len() + self.scales.storage_bytes()
    }

    #[inline]
    fn code(&self, idx: usize) -> u8 {
        let byte = self.packed[idx / 2];
        if idx % 2 == 0 { byte >> 4 } else { byte & 0x0F }
    }

    /// Decode elements `start..start + out.len()` into `out`.
    fn decode_range(&self, start: usize, out: &mut [f32]) {
        let book = codebook(self.quant_type);
        let mut block = usize::MAX;
        let mut scale = 0.0f32;
        for (i, o) in out.iter_mut().enumerate() {
            let idx = start + i;
            if idx / self.block_size != block {
                block = idx / self.block_size;
                scale = self.scales.get(block);
            }
            *o = book[self.code(idx) as usize] * scale;
        }
    }
}

/// Quantize a tensor (any float dtype) to 4-bit according to `config`.
///
/// The final block may be shorter than `block_size`.
pub fn quantize_4bit(tensor: &Tensor, config: &QuantizationConfig) -> Result<QuantizedTensor> {
    config.validate()?;
    let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

    let src = tensor.to_f32()?.contiguous()?;
    let data = src.as_slice_f32()?;
    let n = data.len();
    let bs = config.block_size;
    let search = CodeSearch::new(codebook(config.quant_type));

    let mut packed = vec![0u8; n.div_ceil(2)];
    let absmax: Vec<f32> = packed
        .par_chunks_mut(bs / 2)
        .zip(data.par_chunks(bs))
        .map(|(out, block)| {
            let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
            let inv = if amax == 0.0 { 0.0 } else { 1.0 / amax };
            for (j, pair) in block.chunks(2).enumerate() {
                let hi = search.nearest(pair[0] * inv);
                let lo = pair.get(1).map_or(0, |&v| search.nearest(v * inv));
                out[j] = (hi << 4) | lo;
            }
            amax
        })
        .collect();

    let scales = if config.double_quant {
        BlockScales::double_quantize(&absmax, config.double_quant_block_size)
    } else {
        BlockScales::Full(absmax)
    };

    if let Some(t) = _t {
        log::trace!("[perf] quant::quantize_4bit {:?} n={} {:.3}ms", tensor.shape(), n, t.elapsed().as_secs_f64() * 1000.0);
    }

    Ok(QuantizedTensor {
        shape: tensor.shape().to_vec(),
        quant_type: config.quant_type,
        block_size: bs,
        packed,
        scales,
    })
}

/// Dequantize back to an F32 tensor of the original shape.
pub fn dequantize(q: &QuantizedTensor) -> Result<Tensor> {
    let mut out = vec![0.0f32; q.element_count()];
    out.par_chunks_mut(q.block_size)
        .enumerate()
        .for_each(|(b, chunk)| q.decode_range(b * q.block_size, chunk));
    Tensor::from_f32(out, &q.shape)
}

/// Compute `input · Wᵀ` for F32 input [..., in] and 4-bit weights [out, in].
///
/// Weight rows are decoded on the fly; both operands are rounded to
/// `compute_dtype` and products accumulate in f32.
pub fn quantized_matmul(input: &Tensor, weights: &QuantizedTensor, compute_dtype: ComputeDType) -> Result<Tensor> {
    if input.dtype() != DType::F32 {
        return Err(LoraForgeError::DTypeMismatch);
    }
    let w_shape = weights.shape();
    if w_shape.len() != 2 {
        return Err(LoraForgeError::ShapeMismatch {
            expected: vec![2],
            actual: vec![w_shape.len()],
        });
    }

    let (out_features, in_features) = (w_shape[0], w_shape[1]);
    let input_shape = input.shape();
    let ndim = input_shape.len();
    if ndim == 0 || input_shape[ndim - 1] != in_features {
        return Err(LoraForgeError::ShapeMismatch {
            expected: vec![in_features],
            actual: input_shape.to_vec(),
        });
    }

    let _t = if log::log_enabled!(log::Level::Trace) { Some(Instant::now()) } else { None };

    let m: usize = input_shape[..ndim - 1].iter().product();
    let src = input.contiguous()?;
    let x: Vec<f32> = src.as_slice_f32()?.iter().map(|&v| compute_dtype.round(v)).collect();

    // Column-major scratch: one contiguous column of M results per output feature.
    let mut out_t = vec![0.0f32; out_features * m];
    if m > 0 {
        out_t
            .par_chunks_mut(m)
            .enumerate()
            .for_each_init(
                || vec![0.0f32; in_features],
                |row, (o, col)| {
                    weights.decode_range(o * in_features, row);
                    for w in row.iter_mut() {
                        *w = compute_dtype.round(*w);
                    }
                    for (r, c) in col.iter_mut().enumerate() {
                        let xr = &x[r * in_features..(r + 1) * in_features];
                        *c = xr.iter().zip(row.iter()).map(|(a, b)| a * b).sum();
                    }
                },
            );
    }

    let mut output = vec![0.0f32; m * out_features];
    for o in 0..out_features {
        for r in 0..m {
            output[r * out_features + o] = out_t[o * m + r];
        }
    }

    if let Some(t) = _t {
        log::trace!("[perf] quant::matmul_4bit [{}x{}]x[{}x{}] {:.3}ms",
            m, in_features, out_features, in_features, t.elapsed().as_secs_f64() * 1000.0);
    }

    let mut out_shape = input_shape[..ndim - 1].to_vec();
    out_shape.push(out_features);
    Ok(Tensor::new(f32_vec_to_bytes(output), out_shape, DType::F32))
}

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use crate::error::{LoraForgeError, Result};

pub use crate::core::tensor::ComputeDType;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: Option<usize>, // None means plain MHA
    pub vocab_size: usize,
    pub norm_eps: f32,
    pub max_seq_len: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f32 { 10000.0 }

impl Default for ModelConfig {
    /// Mistral-7B-v0.1 dimensions.
    fn default() -> Self {
        Self {
            dim: 4096,
            hidden_dim: 14336,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: Some(8),
            vocab_size: 32000,
            norm_eps: 1e-5,
            max_seq_len: 32768,
            rope_theta: 10000.0,
            sliding_window: Some(4096),
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            tie_word_embeddings: false,
        }
    }
}

/// HuggingFace Mistral / Llama config.json format.
#[derive(Deserialize)]
struct HFMistralConfig {
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    num_key_value_heads: Option<usize>,
    vocab_size: usize,
    rms_norm_eps: f32,
    max_position_embeddings: usize,
    rope_theta: Option<f32>,
    sliding_window: Option<usize>,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    tie_word_embeddings: Option<bool>,
}

impl ModelConfig {
    /// Load a ModelConfig from a HuggingFace Mistral (or Llama) config.json file.
    pub fn from_hf_mistral<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let hf: HFMistralConfig = serde_json::from_reader(reader)
            .map_err(LoraForgeError::invalid_data)?;

        let config = Self {
            dim: hf.hidden_size,
            hidden_dim: hf.intermediate_size,
            n_layers: hf.num_hidden_layers,
            n_heads: hf.num_attention_heads,
            n_kv_heads: hf.num_key_value_heads,
            vocab_size: hf.vocab_size,
            norm_eps: hf.rms_norm_eps,
            max_seq_len: hf.max_position_embeddings,
            rope_theta: hf.rope_theta.unwrap_or(10000.0),
            sliding_window: hf.sliding_window,
            bos_token_id: hf.bos_token_id,
            eos_token_id: hf.eos_token_id,
            tie_word_embeddings: hf.tie_word_embeddings.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(LoraForgeError::InvalidConfig("dim must be > 0".into()));
        }
        if self.n_heads == 0 {
            return Err(LoraForgeError::InvalidConfig("n_heads must be > 0".into()));
        }
        if self.dim % self.n_heads != 0 {
            return Err(LoraForgeError::InvalidConfig(
                format!("dim ({}) must be divisible by n_heads ({})", self.dim, self.n_heads)
            ));
        }
        if self.head_dim() % 2 != 0 {
            return Err(LoraForgeError::InvalidConfig(
                format!("head_dim ({}) must be even for rotary embeddings", self.head_dim())
            ));
        }
        if self.vocab_size == 0 {
            return Err(LoraForgeError::InvalidConfig("vocab_size must be > 0".into()));
        }
        if self.n_layers == 0 {
            return Err(LoraForgeError::InvalidConfig("n_layers must be > 0".into()));
        }
        if self.max_seq_len == 0 {
            return Err(LoraForgeError::InvalidConfig("max_seq_len must be > 0".into()));
        }
        if let Some(n_kv) = self.n_kv_heads {
            if n_kv == 0 {
                return Err(LoraForgeError::InvalidConfig("n_kv_heads must be > 0".into()));
            }
            if self.n_heads % n_kv != 0 {
                return Err(LoraForgeError::InvalidConfig(
                    format!("n_heads ({}) must be divisible by n_kv_heads ({})", self.n_heads, n_kv)
                ));
            }
        }
        if self.sliding_window == Some(0) {
            return Err(LoraForgeError::InvalidConfig("sliding_window must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    Left,
    Right,
}

/// How prompts are turned into model input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerConfig {
    pub model_max_length: usize,
    pub padding_side: PaddingSide,
    pub add_bos_token: bool,
    pub add_eos_token: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            model_max_length: 512,
            padding_side: PaddingSide::Left,
            add_bos_token: true,
            add_eos_token: true,
        }
    }
}

/// 4-bit codebook used for the base weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// NormalFloat: codes placed at quantiles of N(0, 1).
    Nf4,
    /// Sign + 2-bit exponent + 1-bit mantissa float.
    Fp4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub double_quant: bool,
    pub quant_type: QuantType,
    pub compute_dtype: ComputeDType,
    /// Elements sharing one absmax.
    pub block_size: usize,
    /// Absmax values sharing one second-level scale.
    pub double_quant_block_size: usize,
    /// Internal module names kept in full precision.
    pub skip_modules: Vec<String>,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            double_quant: true,
            quant_type: QuantType::Nf4,
            compute_dtype: ComputeDType::BF16,
            block_size: 64,
            double_quant_block_size: 256,
            skip_modules: vec!["output".to_string()],
        }
    }
}

impl QuantizationConfig {
    /// Full-precision loading; useful for comparisons and small models.
    pub fn disabled() -> Self {
        Self { load_in_4bit: false, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 2 != 0 {
            return Err(LoraForgeError::InvalidConfig(
                format!("block_size ({}) must be a positive even number", self.block_size)
            ));
        }
        if self.double_quant && self.double_quant_block_size == 0 {
            return Err(LoraForgeError::InvalidConfig("double_quant_block_size must be > 0".into()));
        }
        Ok(())
    }

    /// True when the module with this internal prefix should be quantized.
    pub fn should_quantize(&self, module: &str) -> bool {
        self.load_in_4bit && !self.skip_modules.iter().any(|m| m == module)
    }
}

/// Runtime configuration for parallelism and thread management.
/// Must be applied (via `apply()`) before any computation to take effect.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Number of threads for faer and rayon parallelism.
    /// 0 means auto-detect (use all available cores).
    pub num_threads: usize,
}

impl RuntimeConfig {
    /// Apply this runtime configuration globally.
    ///
    /// Sets faer's global parallelism and, for an explicit thread count,
    /// builds rayon's global pool. Rayon's pool can only be built once per
    /// process; a second attempt is reported as an error.
    pub fn apply(&self) -> Result<()> {
        use faer::{set_global_parallelism, Parallelism};

        if self.num_threads == 0 {
            set_global_parallelism(Parallelism::Rayon(0));
        } else {
            set_global_parallelism(Parallelism::Rayon(self.num_threads));
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .build_global()
                .map_err(|e| LoraForgeError::InvalidConfig(
                    format!("Failed to set rayon thread pool: {}", e)
                ))?;
        }
        log::debug!("runtime: threads={}", self.num_threads);

        Ok(())
    }
}

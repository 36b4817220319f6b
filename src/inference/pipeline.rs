use std::path::Path;
use std::time::Instant;

use crate::adapter::AdapterCheckpoint;
use crate::config::{ModelConfig, QuantizationConfig, TokenizerConfig};
use crate::error::Result;
use crate::hub::ModelSource;
use crate::loader::WeightMap;
use crate::models::LlmModel;
use crate::tokenization::{HFTokenizer, PromptEncoder};

use super::generator::{GenerationBudget, GenerationConfig, Generator};

/// Pad id passed to generation; Mistral's `</s>`.
pub const DEFAULT_PAD_TOKEN_ID: u32 = 2;

#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub tokenizer: TokenizerConfig,
    pub quantization: QuantizationConfig,
    pub num_beams: usize,
    pub pad_token_id: u32,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            tokenizer: TokenizerConfig::default(),
            quantization: QuantizationConfig::default(),
            num_beams: 1,
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
        }
    }
}

/// A 4-bit base model with a LoRA adapter applied, ready for generation.
pub struct ModelInference {
    model: LlmModel,
    encoder: PromptEncoder,
    options: InferenceOptions,
}

impl ModelInference {
    /// Resolve `base_model`, load tokenizer and config, load and quantize the
    /// weights, apply the adapter found in `checkpoint_path`, and switch to
    /// eval mode. The adapter checkpoint is read first so a bad path fails
    /// before any base-model download.
    pub fn load<P: AsRef<Path>>(base_model: &str, checkpoint_path: P, options: &InferenceOptions) -> Result<Self> {
        let start = Instant::now();
        let checkpoint = AdapterCheckpoint::load(checkpoint_path.as_ref())?;
        if let Some(trained_on) = &checkpoint.config.base_model_name_or_path {
            if trained_on != base_model {
                log::warn!("adapter was trained on '{}' but base model is '{}'", trained_on, base_model);
            }
        }

        let source = ModelSource::resolve(base_model)?;
        let tokenizer = HFTokenizer::from_file(&source.tokenizer_path)?;
        let encoder = PromptEncoder::new(Box::new(tokenizer), options.tokenizer.clone())?
            .with_pad_id(options.pad_token_id);

        let config = ModelConfig::from_hf_mistral(&source.config_path)?;
        let map = WeightMap::mistral(config.n_layers);
        let weights = map.remap(source.load_weights()?);
        map.validate(&weights, config.tie_word_embeddings)?;

        let mut model = LlmModel::from_pretrained(&config, weights, &options.quantization)?;
        let attached = checkpoint.apply_to(&mut model)?;
        model.eval();

        let (total, frozen) = model.parameter_count();
        log::info!(
            "ready in {:.1}s: {} adapters, {} params ({} frozen)",
            start.elapsed().as_secs_f64(), attached, total, frozen
        );

        Ok(Self { model, encoder, options: options.clone() })
    }

    /// Assemble from already-built parts.
    pub fn from_parts(model: LlmModel, encoder: PromptEncoder, options: InferenceOptions) -> Self {
        Self { model, encoder, options }
    }

    pub fn model(&self) -> &LlmModel {
        &self.model
    }

    pub fn encoder(&self) -> &PromptEncoder {
        &self.encoder
    }

    /// Generation settings used by `generate_response`.
    pub fn response_config(&self, max_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            budget: GenerationBudget::MaxLength(max_tokens),
            num_beams: self.options.num_beams,
            pad_token_id: Some(self.options.pad_token_id),
            ..GenerationConfig::default()
        }
    }

    /// Prompt plus continuation, special tokens removed. `max_tokens` caps the
    /// total sequence length, prompt included.
    pub fn generate_response(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        self.generate_with(prompt, &self.response_config(max_tokens))
    }

    pub fn generate_with(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        Generator::new(&self.model, &self.encoder, config.clone()).generate(prompt)
    }
}

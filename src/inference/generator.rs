use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::attention::KVCache;
use crate::error::{LoraForgeError, Result};
use crate::models::LlmModel;
use crate::tokenization::{PromptEncoder, TokenizedInput};

use super::sampling;

/// How far generation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationBudget {
    /// Cap on the whole sequence, prompt included.
    MaxLength(usize),
    /// Cap on newly generated tokens only.
    MaxNewTokens(usize),
}

impl GenerationBudget {
    /// Number of tokens that may be generated after a prompt of `prompt_len`.
    /// A total-length cap the prompt already reaches still yields one token.
    pub fn new_tokens(&self, prompt_len: usize) -> usize {
        match *self {
            GenerationBudget::MaxLength(n) if prompt_len >= n => {
                log::warn!(
                    "input length is {} but max_length is {}; generating a single token. \
                     Consider raising max_length or using max_new_tokens",
                    prompt_len, n
                );
                1
            }
            GenerationBudget::MaxLength(n) => n - prompt_len,
            GenerationBudget::MaxNewTokens(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub budget: GenerationBudget,
    /// 1 = greedy / sampling, >1 = beam search.
    pub num_beams: usize,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    /// Beam scores are divided by `generated_len ^ length_penalty`.
    pub length_penalty: f32,
    /// Fills finished rows of a batch up to the longest row.
    pub pad_token_id: Option<u32>,
    /// Overrides the encoder's EOS id.
    pub eos_token_id: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            budget: GenerationBudget::MaxLength(20),
            num_beams: 1,
            do_sample: false,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: None,
            length_penalty: 1.0,
            pad_token_id: None,
            eos_token_id: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            return Err(LoraForgeError::InvalidConfig("num_beams must be >= 1".into()));
        }
        if self.do_sample && self.temperature <= 0.0 {
            return Err(LoraForgeError::InvalidConfig("temperature must be > 0 when sampling".into()));
        }
        if self.do_sample && self.num_beams > 1 {
            return Err(LoraForgeError::NotImplemented("beam-search sampling".into()));
        }
        Ok(())
    }
}

/// Autoregressive decoding over an `LlmModel`. Nothing here records gradients.
pub struct Generator<'a> {
    pub(crate) model: &'a LlmModel,
    pub(crate) encoder: &'a PromptEncoder,
    pub(crate) config: GenerationConfig,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a LlmModel, encoder: &'a PromptEncoder, config: GenerationConfig) -> Self {
        Self { model, encoder, config }
    }

    pub fn with_budget(mut self, budget: GenerationBudget) -> Self {
        self.config.budget = budget;
        self
    }

    pub fn with_num_beams(mut self, num_beams: usize) -> Self {
        self.config.num_beams = num_beams;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_k: Option<usize>, top_p: Option<f32>) -> Self {
        self.config.do_sample = true;
        self.config.temperature = temperature;
        self.config.top_k = top_k;
        self.config.top_p = top_p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub(crate) fn eos_id(&self) -> u32 {
        self.config.eos_token_id.unwrap_or_else(|| self.encoder.eos_id())
    }

    /// Encode, generate, and decode the full sequence with special tokens skipped.
    pub fn generate(&self, prompt: &str) -> Result<String> {
        let prompt_ids = self.encoder.encode(prompt)?;
        let ids = self.generate_ids(&prompt_ids, prompt_ids.len())?;
        self.encoder.decode(&ids, true)
    }

    /// Generate for each row of a padded batch. Padded positions are dropped
    /// before prefill; the budget is measured against the padded width, as the
    /// batch shares one length. Shorter outputs are right-filled with the pad id.
    pub fn generate_batch(&self, batch: &TokenizedInput) -> Result<Vec<Vec<u32>>> {
        let width = batch.input_ids.iter().map(Vec::len).max().unwrap_or(0);
        let mut outputs = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let ids = batch.unpadded(i).ok_or_else(|| LoraForgeError::IndexOutOfBounds {
                index: i,
                dim: 0,
                size: batch.len(),
            })?;
            outputs.push(self.generate_ids(&ids, width)?);
        }

        let pad = self.config.pad_token_id.unwrap_or_else(|| self.eos_id());
        let longest = outputs.iter().map(Vec::len).max().unwrap_or(0);
        for out in &mut outputs {
            out.resize(longest, pad);
        }
        Ok(outputs)
    }

    /// Prompt followed by the generated continuation. `budget_len` is the
    /// length the budget is measured against (the prompt length when unpadded).
    pub fn generate_ids(&self, prompt_ids: &[u32], budget_len: usize) -> Result<Vec<u32>> {
        self.config.validate()?;
        if prompt_ids.is_empty() {
            return Err(LoraForgeError::InvalidConfig("cannot generate from an empty input".into()));
        }
        if !self.model.is_eval() {
            log::warn!("generating with a model that is not in eval mode");
        }

        let new_tokens = self.config.budget.new_tokens(budget_len);
        let capacity = prompt_ids.len() + new_tokens;
        let max_positions = self.model.config().max_seq_len;
        if capacity > max_positions {
            return Err(LoraForgeError::SequenceLengthExceeded { max: max_positions, actual: capacity });
        }

        let start = Instant::now();
        let ids = if self.config.num_beams > 1 {
            self.beam_search(prompt_ids, new_tokens, capacity)?
        } else {
            self.decode_loop(prompt_ids, new_tokens, capacity)?
        };
        log::debug!(
            "generated {} tokens (prompt {}) in {:.2}s",
            ids.len() - prompt_ids.len(), prompt_ids.len(), start.elapsed().as_secs_f64()
        );
        Ok(ids)
    }

    pub(crate) fn make_cache(&self, capacity: usize) -> KVCache {
        self.model.make_cache(capacity)
    }

    /// Run the prompt through the model and return the last position's logits.
    pub(crate) fn prefill(&self, ids: &[u32], cache: &mut KVCache) -> Result<Vec<f32>> {
        let logits = self.model.forward_with_cache(ids, cache)?;
        last_row(&logits.to_vec_f32()?, self.model.config().vocab_size)
    }

    /// Feed a single token and return the next logits.
    pub(crate) fn decode_step(&self, token: u32, cache: &mut KVCache) -> Result<Vec<f32>> {
        self.prefill(&[token], cache)
    }

    fn decode_loop(&self, prompt_ids: &[u32], new_tokens: usize, capacity: usize) -> Result<Vec<u32>> {
        let eos = self.eos_id();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut cache = self.make_cache(capacity);
        let mut tokens = prompt_ids.to_vec();
        let mut logits = self.prefill(prompt_ids, &mut cache)?;

        for step in 0..new_tokens {
            let next = self.pick_token(&logits, &tokens, &mut rng);
            tokens.push(next);
            if next == eos {
                log::debug!("EOS after {} new tokens", step + 1);
                break;
            }
            if step + 1 < new_tokens {
                logits = self.decode_step(next, &mut cache)?;
            }
        }
        Ok(tokens)
    }

    /// repetition penalty -> greedy, or temperature -> top-k -> top-p -> categorical.
    fn pick_token(&self, logits: &[f32], past: &[u32], rng: &mut StdRng) -> u32 {
        let mut logits = logits.to_vec();
        if let Some(penalty) = self.config.repetition_penalty {
            sampling::apply_repetition_penalty(&mut logits, past, penalty);
        }
        if !self.config.do_sample {
            return sampling::argmax(&logits);
        }

        for v in logits.iter_mut() {
            *v /= self.config.temperature;
        }
        if let Some(k) = self.config.top_k {
            sampling::apply_top_k(&mut logits, k);
        }
        if let Some(p) = self.config.top_p {
            sampling::apply_top_p(&mut logits, p);
        }
        sampling::sample_categorical(&logits, rng)
    }
}

pub(crate) fn last_row(logits: &[f32], vocab: usize) -> Result<Vec<f32>> {
    if logits.len() < vocab || vocab == 0 {
        return Err(LoraForgeError::ShapeMismatch { expected: vec![vocab], actual: vec![logits.len()] });
    }
    Ok(logits[logits.len() - vocab..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_total_length() {
        assert_eq!(GenerationBudget::MaxLength(50).new_tokens(10), 40);
        assert_eq!(GenerationBudget::MaxLength(50).new_tokens(50), 1);
        assert_eq!(GenerationBudget::MaxLength(5).new_tokens(80), 1);
        assert_eq!(GenerationBudget::MaxNewTokens(7).new_tokens(80), 7);
    }

    #[test]
    fn test_config_validation() {
        assert!(GenerationConfig::default().validate().is_ok());
        assert!(GenerationConfig { num_beams: 0, ..Default::default() }.validate().is_err());
        assert!(GenerationConfig { do_sample: true, num_beams: 2, ..Default::default() }.validate().is_err());
        assert!(GenerationConfig { do_sample: true, temperature: 0.0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_last_row() {
        assert_eq!(last_row(&[1.0, 2.0, 3.0, 4.0], 2).unwrap(), vec![3.0, 4.0]);
        assert!(last_row(&[1.0], 2).is_err());
    }
}

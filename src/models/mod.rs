use std::collections::HashMap;
use std::time::Instant;

use crate::attention::{Attention, KVCache, RopeFreqs};
use crate::config::{ModelConfig, QuantizationConfig};
use crate::core::tensor::Tensor;
use crate::error::{LoraForgeError, Result};
use crate::nn::{Embedding, Freezable, Layer, Linear, RmsNorm};
use crate::transformer::{FeedForward, TransformerBlock};

/// Mistral-style decoder-only language model.
pub struct LlmModel {
    config: ModelConfig,
    pub token_embedding: Embedding,
    pub layers: Vec<TransformerBlock>,
    pub norm: RmsNorm,
    pub output: Linear,
    rope: RopeFreqs,
    training: bool,
}

impl LlmModel {
    /// Build from internally-named weights (see `WeightMap`), quantizing the
    /// linear layers that `quant` selects. Weights are consumed layer by layer
    /// so full-precision copies do not accumulate.
    pub fn from_pretrained(config: &ModelConfig, mut weights: HashMap<String, Tensor>, quant: &QuantizationConfig) -> Result<Self> {
        config.validate()?;
        quant.validate()?;
        let start = Instant::now();

        let mut take = |key: &str| -> Result<Tensor> {
            weights.remove(key).ok_or_else(|| LoraForgeError::MissingWeight(key.to_string()))
        };

        let embed_weight = take("token_embedding.weight")?;
        if embed_weight.shape() != [config.vocab_size, config.dim] {
            return Err(LoraForgeError::InvalidConfig(format!(
                "token embedding is {:?}, config expects [{}, {}]",
                embed_weight.shape(), config.vocab_size, config.dim
            )));
        }

        let linear = |take: &mut dyn FnMut(&str) -> Result<Tensor>, module: &str| -> Result<Linear> {
            let mut lin = Linear::from_weights(take(&format!("{}.weight", module))?, None)?;
            if quant.should_quantize(module) {
                lin.quantize(quant)?;
            }
            Ok(lin)
        };

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let p = format!("layers.{}", i);
            let attention = Attention::from_weights(
                config,
                linear(&mut take, &format!("{}.attention.q_proj", p))?,
                linear(&mut take, &format!("{}.attention.k_proj", p))?,
                linear(&mut take, &format!("{}.attention.v_proj", p))?,
                linear(&mut take, &format!("{}.attention.out_proj", p))?,
            )?;
            let feed_forward = FeedForward::from_weights(
                linear(&mut take, &format!("{}.feed_forward.gate_proj", p))?,
                linear(&mut take, &format!("{}.feed_forward.up_proj", p))?,
                linear(&mut take, &format!("{}.feed_forward.down_proj", p))?,
            )?;
            let attention_norm = RmsNorm::from_weights(take(&format!("{}.attention_norm.weight", p))?, config.norm_eps)?;
            let ffn_norm = RmsNorm::from_weights(take(&format!("{}.ffn_norm.weight", p))?, config.norm_eps)?;
            layers.push(TransformerBlock::from_weights(attention, feed_forward, attention_norm, ffn_norm));
            log::debug!("built layer {}/{}", i + 1, config.n_layers);
        }

        let norm = RmsNorm::from_weights(take("norm.weight")?, config.norm_eps)?;
        let output = if config.tie_word_embeddings {
            let mut lin = Linear::from_weights(embed_weight.clone(), None)?;
            if quant.should_quantize("output") {
                lin.quantize(quant)?;
            }
            lin
        } else {
            linear(&mut take, "output")?
        };
        if output.out_features() != config.vocab_size {
            return Err(LoraForgeError::InvalidConfig(format!(
                "output head has {} rows, config expects vocab_size {}",
                output.out_features(), config.vocab_size
            )));
        }

        let token_embedding = Embedding::from_weights(embed_weight)?;

        for leftover in weights.keys() {
            log::warn!("unused weight '{}'", leftover);
        }

        let rope = RopeFreqs::new(config.head_dim(), config.max_seq_len, config.rope_theta);
        log::info!(
            "model built: {} layers, 4-bit={} ({:?}), {:.2}s",
            config.n_layers, quant.load_in_4bit, quant.quant_type, start.elapsed().as_secs_f64()
        );

        Ok(Self {
            config: config.clone(),
            token_embedding,
            layers,
            norm,
            output,
            rope,
            training: true,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Switch to evaluation mode. Dropout is never applied in this mode.
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_eval(&self) -> bool {
        !self.training
    }

    /// Fresh KV cache able to hold `capacity` positions.
    pub fn make_cache(&self, capacity: usize) -> KVCache {
        KVCache::new(self.config.n_layers, capacity, self.config.head_dim(), self.config.kv_heads())
    }

    /// Run `ids` (continuing at `cache.current_len()`) and return logits [1, S, vocab].
    /// The cache is advanced past the new tokens.
    pub fn forward_with_cache(&self, ids: &[u32], cache: &mut KVCache) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(LoraForgeError::ShapeMismatch { expected: vec![1], actual: vec![0] });
        }

        let mut x = self.token_embedding.forward(ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward_with_cache(&x, cache, i, &self.rope)?;
        }
        cache.advance(ids.len());

        let x = self.norm.forward(&x)?;
        self.output.forward(&x)
    }

    /// Linear layer by internal module name, e.g. `layers.3.attention.q_proj` or `output`.
    pub fn linear_mut(&mut self, name: &str) -> Option<&mut Linear> {
        if name == "output" {
            return Some(&mut self.output);
        }
        let rest = name.strip_prefix("layers.")?;
        let (idx, inner) = rest.split_once('.')?;
        let idx: usize = idx.parse().ok()?;
        self.layers.get_mut(idx)?.linear_mut(inner)
    }

    /// Replace the weight of an internal module (`token_embedding`, a norm, or
    /// a linear layer) with a tensor of identical shape.
    pub fn replace_weight(&mut self, name: &str, weight: Tensor) -> Result<()> {
        let check = |current: &[usize], weight: &Tensor| -> Result<()> {
            if weight.shape() != current {
                return Err(LoraForgeError::AdapterMismatch(format!(
                    "replacement weight {:?} does not match {:?}", weight.shape(), current
                )));
            }
            Ok(())
        };

        let eps = self.config.norm_eps;
        let norm = match name {
            "token_embedding" => {
                check(self.token_embedding.weight.shape(), &weight)?;
                self.token_embedding = Embedding::from_weights(weight)?;
                return Ok(());
            }
            "norm" => Some(&mut self.norm),
            _ => name
                .strip_prefix("layers.")
                .and_then(|rest| rest.split_once('.'))
                .and_then(|(idx, inner)| {
                    let layer = self.layers.get_mut(idx.parse::<usize>().ok()?)?;
                    match inner {
                        "attention_norm" => Some(&mut layer.attention_norm),
                        "ffn_norm" => Some(&mut layer.ffn_norm),
                        _ => None,
                    }
                }),
        };
        if let Some(norm) = norm {
            check(norm.weight.shape(), &weight)?;
            *norm = RmsNorm::from_weights(weight, eps)?;
            return Ok(());
        }

        match self.linear_mut(name) {
            Some(linear) => linear.replace_weight(weight),
            None => Err(LoraForgeError::MissingWeight(format!("no module named '{}'", name))),
        }
    }

    /// Every linear layer with its internal module name.
    pub fn linears(&self) -> Vec<(String, &Linear)> {
        let mut out: Vec<(String, &Linear)> = self
            .layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer.linears().into_iter().map(move |(name, lin)| (format!("layers.{}.{}", i, name), lin))
            })
            .collect();
        out.push(("output".to_string(), &self.output));
        out
    }

    /// Named non-linear parameters (embedding and norms).
    pub fn other_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out = vec![("token_embedding.weight".to_string(), &self.token_embedding.weight)];
        for (i, layer) in self.layers.iter().enumerate() {
            out.push((format!("layers.{}.attention_norm.weight", i), &layer.attention_norm.weight));
            out.push((format!("layers.{}.ffn_norm.weight", i), &layer.ffn_norm.weight));
        }
        out.push(("norm.weight".to_string(), &self.norm.weight));
        out
    }

    /// Returns (total_params, frozen_params). Adapter parameters count as trainable.
    pub fn parameter_count(&self) -> (usize, usize) {
        let mut total = 0usize;
        let mut frozen = 0usize;

        for (_, t) in self.other_parameters() {
            total += t.element_count();
        }

        for (_, lin) in self.linears() {
            let base: usize = lin.weight.shape().iter().product();
            total += base;
            if lin.is_frozen() {
                frozen += base;
            }
            if let Some(lora) = &lin.lora {
                total += lora.rank() * (lora.in_features() + lora.out_features());
            }
        }

        (total, frozen)
    }
}

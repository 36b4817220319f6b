use std::collections::HashMap;
use crate::core::tensor::Tensor;
use crate::error::{LoraForgeError, Result};

/// Per-layer modules as (HF suffix, internal suffix), without `.weight`.
const LAYER_MODULES: [(&str, &str); 9] = [
    ("self_attn.q_proj", "attention.q_proj"),
    ("self_attn.k_proj", "attention.k_proj"),
    ("self_attn.v_proj", "attention.v_proj"),
    ("self_attn.o_proj", "attention.out_proj"),
    ("mlp.gate_proj", "feed_forward.gate_proj"),
    ("mlp.up_proj", "feed_forward.up_proj"),
    ("mlp.down_proj", "feed_forward.down_proj"),
    ("input_layernorm", "attention_norm"),
    ("post_attention_layernorm", "ffn_norm"),
];

const GLOBAL_MODULES: [(&str, &str); 3] = [
    ("model.embed_tokens", "token_embedding"),
    ("model.norm", "norm"),
    ("lm_head", "output"),
];

/// Maps HuggingFace module and tensor names to internal names.
pub struct WeightMap {
    modules: HashMap<String, String>,
    n_layers: usize,
}

impl WeightMap {
    /// Mistral / Llama decoder naming:
    /// - `model.embed_tokens` → `token_embedding`
    /// - `model.layers.{i}.self_attn.{q,k,v,o}_proj` → `layers.{i}.attention.{q,k,v,out}_proj`
    /// - `model.layers.{i}.mlp.{gate,up,down}_proj` → `layers.{i}.feed_forward.{gate,up,down}_proj`
    /// - `model.layers.{i}.{input,post_attention}_layernorm` → `layers.{i}.{attention,ffn}_norm`
    /// - `model.norm` → `norm`, `lm_head` → `output`
    pub fn mistral(n_layers: usize) -> Self {
        let mut modules: HashMap<String, String> = GLOBAL_MODULES
            .iter()
            .map(|(hf, internal)| (hf.to_string(), internal.to_string()))
            .collect();

        for i in 0..n_layers {
            for (hf, internal) in LAYER_MODULES {
                modules.insert(format!("model.layers.{}.{}", i, hf), format!("layers.{}.{}", i, internal));
            }
        }

        Self { modules, n_layers }
    }

    /// Internal name of an HF module path such as `model.layers.3.mlp.up_proj`.
    pub fn module(&self, hf_module: &str) -> Option<&str> {
        self.modules.get(hf_module).map(String::as_str)
    }

    /// Internal name of an HF tensor name such as `model.norm.weight`.
    pub fn tensor(&self, hf_name: &str) -> Option<String> {
        let (module, param) = hf_name.rsplit_once('.')?;
        self.module(module).map(|m| format!("{}.{}", m, param))
    }

    /// Rename HF tensors. Unmapped tensors (rotary caches, extra layers) are logged and dropped.
    pub fn remap(&self, hf_weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
        let mut remapped = HashMap::with_capacity(hf_weights.len());
        for (hf_name, tensor) in hf_weights {
            match self.tensor(&hf_name) {
                Some(internal) => {
                    remapped.insert(internal, tensor);
                }
                None => log::warn!("skipping unmapped tensor '{}'", hf_name),
            }
        }
        remapped
    }

    /// Check that every required weight is present. `output.weight` is only
    /// required when the head is not tied to the embedding.
    pub fn validate(&self, weights: &HashMap<String, Tensor>, tie_word_embeddings: bool) -> Result<()> {
        let mut required: Vec<String> = vec!["token_embedding.weight".into(), "norm.weight".into()];
        if !tie_word_embeddings {
            required.push("output.weight".into());
        }
        for i in 0..self.n_layers {
            required.extend(LAYER_MODULES.iter().map(|(_, m)| format!("layers.{}.{}.weight", i, m)));
        }

        let missing: Vec<String> = required.into_iter().filter(|k| !weights.contains_key(k)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LoraForgeError::MissingWeight(missing.join(", ")))
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

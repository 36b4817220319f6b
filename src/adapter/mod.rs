//! Low-rank adapters (LoRA) and PEFT checkpoint loading.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::core::tensor::Tensor;
use crate::error::{LoraForgeError, Result};
use crate::loader::{ModelLoader, WeightMap};
use crate::models::LlmModel;

pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";

/// A low-rank update `scaling · B·A` for one linear layer.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f32,
}

impl LoraAdapter {
    /// `lora_a` is [r, in], `lora_b` is [out, r].
    pub fn new(lora_a: Tensor, lora_b: Tensor, scaling: f32) -> Result<Self> {
        let (a, b) = (lora_a.shape(), lora_b.shape());
        if a.len() != 2 || b.len() != 2 || a[0] != b[1] {
            return Err(LoraForgeError::AdapterMismatch(format!(
                "lora_A {:?} and lora_B {:?} do not share a rank", a, b
            )));
        }
        Ok(Self {
            lora_a: lora_a.to_f32()?.contiguous()?,
            lora_b: lora_b.to_f32()?.contiguous()?,
            scaling,
        })
    }

    pub fn rank(&self) -> usize {
        self.lora_a.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.lora_b.shape()[0]
    }

    pub fn scaling(&self) -> f32 {
        self.scaling
    }

    /// `(x · Aᵀ) · Bᵀ · scaling` for x [..., in].
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        input
            .matmul_transposed(&self.lora_a)?
            .matmul_transposed(&self.lora_b)?
            .mul_scalar(self.scaling)
    }

    /// Dense `scaling · B·A`, shaped like the base weight [out, in].
    pub fn delta_weight(&self) -> Result<Tensor> {
        self.lora_b.matmul(&self.lora_a)?.mul_scalar(self.scaling)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

/// `adapter_config.json` as written by PEFT.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub rank_pattern: HashMap<String, usize>,
    #[serde(default)]
    pub alpha_pattern: HashMap<String, f32>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub peft_type: Option<String>,
    /// Modules trained in full and saved alongside the adapter, e.g. `lm_head`.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
}

fn default_bias() -> String {
    "none".into()
}

/// Value from a PEFT `*_pattern` map whose key is a dotted suffix of `module`.
fn pattern_lookup<T: Copy>(patterns: &HashMap<String, T>, module: &str) -> Option<T> {
    patterns
        .iter()
        .filter(|(key, _)| module == key.as_str() || module.ends_with(&format!(".{}", key)))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, v)| *v)
}

impl AdapterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))
            .map_err(LoraForgeError::invalid_data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(peft_type) = &self.peft_type {
            if peft_type != "LORA" {
                return Err(LoraForgeError::InvalidConfig(format!("unsupported peft_type '{}'", peft_type)));
            }
        }
        if self.r == 0 {
            return Err(LoraForgeError::InvalidConfig("adapter rank r must be > 0".into()));
        }
        if self.bias != "none" {
            return Err(LoraForgeError::NotImplemented(format!("adapter bias mode '{}'", self.bias)));
        }
        Ok(())
    }

    /// True when `module` is named (by dotted suffix) in `modules_to_save`.
    pub fn saves(&self, module: &str) -> bool {
        self.modules_to_save.iter().flatten().any(|key| {
            module == key.as_str() || module.ends_with(&format!(".{}", key))
        })
    }

    /// Rank for an HF module path, honouring `rank_pattern`.
    pub fn rank_for(&self, module: &str) -> usize {
        pattern_lookup(&self.rank_pattern, module).unwrap_or(self.r)
    }

    /// `alpha / r`, or `alpha / sqrt(r)` with rank-stabilized LoRA.
    pub fn scaling_for(&self, module: &str) -> f32 {
        let r = self.rank_for(module) as f32;
        let alpha = pattern_lookup(&self.alpha_pattern, module).unwrap_or(self.lora_alpha);
        if self.use_rslora { alpha / r.sqrt() } else { alpha / r }
    }
}

/// A PEFT LoRA checkpoint directory.
pub struct AdapterCheckpoint {
    pub config: AdapterConfig,
    /// Keyed by HF module path, e.g. `model.layers.0.self_attn.q_proj`.
    adapters: BTreeMap<String, LoraAdapter>,
    /// Full replacement weights from `modules_to_save`, keyed by HF module path.
    saved: BTreeMap<String, Tensor>,
}

/// What a tensor in `adapter_model.safetensors` holds.
#[derive(Debug, PartialEq)]
enum PeftTensor<'a> {
    LoraA(&'a str),
    LoraB(&'a str),
    /// `<module>.modules_to_save[.<adapter>].weight`
    Saved(&'a str),
    /// `<module>.weight`: a saved module once PEFT has stripped the wrapper names.
    Plain(&'a str),
    LoraEmbedding(&'a str),
}

/// Empty, or a single adapter name such as ".default".
fn is_adapter_suffix(tail: &str) -> bool {
    tail.is_empty() || (tail.starts_with('.') && !tail[1..].contains('.'))
}

/// Classify `base_model.model.<module>...weight`. Anything else is `None`.
fn parse_peft_name(name: &str) -> Option<PeftTensor<'_>> {
    let rest = name.strip_prefix(PEFT_PREFIX)?;
    let rest = rest.strip_suffix(".weight")?;
    for marker in [".lora_embedding_A", ".lora_embedding_B"] {
        if let Some(idx) = rest.find(marker) {
            return Some(PeftTensor::LoraEmbedding(&rest[..idx]));
        }
    }
    for marker in [".lora_A", ".lora_B", ".modules_to_save"] {
        if let Some(idx) = rest.find(marker) {
            if !is_adapter_suffix(&rest[idx + marker.len()..]) {
                return None;
            }
            let module = &rest[..idx];
            return Some(match marker {
                ".lora_A" => PeftTensor::LoraA(module),
                ".lora_B" => PeftTensor::LoraB(module),
                _ => PeftTensor::Saved(module),
            });
        }
    }
    Some(PeftTensor::Plain(rest))
}

impl AdapterCheckpoint {
    /// Read `adapter_config.json` and `adapter_model.safetensors` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LoraForgeError::ModelNotFound(format!("adapter directory {} does not exist", dir.display())));
        }
        let config_path = dir.join(ADAPTER_CONFIG);
        if !config_path.is_file() {
            return Err(LoraForgeError::ModelNotFound(format!("no {} in {}", ADAPTER_CONFIG, dir.display())));
        }
        let weights_path = dir.join(ADAPTER_WEIGHTS);
        if !weights_path.is_file() {
            return Err(LoraForgeError::ModelNotFound(format!("no {} in {}", ADAPTER_WEIGHTS, dir.display())));
        }

        let config = AdapterConfig::from_file(&config_path)?;
        if config.fan_in_fan_out {
            log::warn!("fan_in_fan_out is set but Mistral projections are plain linear layers; ignoring it");
        }
        let tensors = ModelLoader::load_safetensors(&weights_path)?;
        let checkpoint = Self::from_tensors(config, tensors)?;

        log::info!(
            "loaded LoRA adapter: {} modules, {} saved modules, r={}, alpha={}, rslora={}",
            checkpoint.adapters.len(), checkpoint.saved.len(),
            checkpoint.config.r, checkpoint.config.lora_alpha, checkpoint.config.use_rslora
        );
        Ok(checkpoint)
    }

    /// Build an in-memory checkpoint from PEFT-named tensors.
    pub fn from_tensors(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        config.validate()?;
        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        let mut saved = BTreeMap::new();
        for (name, tensor) in tensors {
            match parse_peft_name(&name) {
                Some(PeftTensor::LoraA(module)) => halves.entry(module.to_string()).or_default().0 = Some(tensor),
                Some(PeftTensor::LoraB(module)) => halves.entry(module.to_string()).or_default().1 = Some(tensor),
                Some(PeftTensor::Saved(module) | PeftTensor::Plain(module)) if config.saves(module) => {
                    saved.insert(module.to_string(), tensor);
                }
                Some(PeftTensor::LoraEmbedding(module)) => {
                    return Err(LoraForgeError::NotImplemented(format!("LoRA on embedding layer '{}'", module)));
                }
                _ => {
                    return Err(LoraForgeError::AdapterMismatch(format!(
                        "unrecognised adapter tensor '{}'", name
                    )))
                }
            }
        }

        for key in config.modules_to_save.iter().flatten() {
            if !saved.keys().any(|m| m == key || m.ends_with(&format!(".{}", key))) {
                return Err(LoraForgeError::AdapterMismatch(format!(
                    "modules_to_save lists '{}' but the checkpoint has no weights for it", key
                )));
            }
        }

        let adapters = Self::pair_tensors(&config, halves)?;
        Ok(Self { config, adapters, saved })
    }

    fn pair_tensors(
        config: &AdapterConfig,
        halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)>,
    ) -> Result<BTreeMap<String, LoraAdapter>> {
        let mut adapters = BTreeMap::new();
        for (module, pair) in halves {
            let (a, b) = match pair {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(LoraForgeError::AdapterMismatch(format!(
                        "module '{}' is missing lora_A or lora_B", module
                    )))
                }
            };
            let expected_r = config.rank_for(&module);
            if a.shape().first() != Some(&expected_r) {
                return Err(LoraForgeError::AdapterMismatch(format!(
                    "module '{}': lora_A {:?} does not have rank {}", module, a.shape(), expected_r
                )));
            }
            let adapter = LoraAdapter::new(a, b, config.scaling_for(&module))?;
            adapters.insert(module, adapter);
        }
        Ok(adapters)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// HF module paths carrying an adapter.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// HF module paths whose weights the checkpoint replaces outright.
    pub fn saved_modules(&self) -> impl Iterator<Item = &str> {
        self.saved.keys().map(String::as_str)
    }

    /// Swap in `modules_to_save` weights, then attach every adapter to its
    /// target linear layer. Returns the number of adapters attached.
    pub fn apply_to(self, model: &mut LlmModel) -> Result<usize> {
        let n_layers = model.config().n_layers;
        let map = WeightMap::mistral(n_layers);

        for (module, weight) in self.saved {
            let internal = map.module(&module).ok_or_else(|| {
                LoraForgeError::AdapterMismatch(format!(
                    "saved module '{}' does not exist in a {}-layer base model", module, n_layers
                ))
            })?;
            model.replace_weight(internal, weight).map_err(|e| match e {
                LoraForgeError::AdapterMismatch(msg) => LoraForgeError::AdapterMismatch(format!("{}: {}", module, msg)),
                other => other,
            })?;
            log::info!("replaced '{}' with its fine-tuned copy", module);
        }

        let mut attached = 0;

        for (module, adapter) in self.adapters {
            let internal = map.module(&module).ok_or_else(|| {
                LoraForgeError::AdapterMismatch(format!(
                    "adapter targets '{}', which a {}-layer base model does not have", module, n_layers
                ))
            })?;
            let linear = model.linear_mut(internal).ok_or_else(|| {
                LoraForgeError::AdapterMismatch(format!("'{}' is not a linear layer", module))
            })?;
            linear.attach_lora(adapter).map_err(|e| match e {
                LoraForgeError::AdapterMismatch(msg) => LoraForgeError::AdapterMismatch(format!("{}: {}", module, msg)),
                other => other,
            })?;
            attached += 1;
        }

        log::debug!("attached {} LoRA adapters", attached);
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(extra: &str) -> AdapterConfig {
        serde_json::from_str(&format!(
            r#"{{"r": 8, "lora_alpha": 16, "peft_type": "LORA", "target_modules": ["q_proj", "v_proj"]{}}}"#,
            extra
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_peft_names() {
        assert_eq!(
            parse_peft_name("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            Some(PeftTensor::LoraA("model.layers.0.self_attn.q_proj"))
        );
        assert_eq!(
            parse_peft_name("base_model.model.lm_head.lora_B.default.weight"),
            Some(PeftTensor::LoraB("lm_head"))
        );
        assert_eq!(
            parse_peft_name("base_model.model.lm_head.modules_to_save.default.weight"),
            Some(PeftTensor::Saved("lm_head"))
        );
        assert_eq!(
            parse_peft_name("base_model.model.model.embed_tokens.weight"),
            Some(PeftTensor::Plain("model.embed_tokens"))
        );
        assert_eq!(
            parse_peft_name("base_model.model.model.embed_tokens.lora_embedding_A.weight"),
            Some(PeftTensor::LoraEmbedding("model.embed_tokens"))
        );
        assert_eq!(parse_peft_name("base_model.model.lm_head.lora_A.a.b.weight"), None);
        assert_eq!(parse_peft_name("model.layers.0.self_attn.q_proj.weight"), None);
    }

    #[test]
    fn test_scaling_variants() {
        let c = config_json("");
        assert_eq!(c.scaling_for("model.layers.0.self_attn.q_proj"), 2.0);
        assert_eq!(c.target_modules, Some(TargetModules::List(vec!["q_proj".into(), "v_proj".into()])));

        let rs = config_json(r#", "use_rslora": true, "rank_pattern": {"v_proj": 4}"#);
        assert!((rs.scaling_for("model.layers.0.self_attn.q_proj") - 16.0 / 8f32.sqrt()).abs() < 1e-6);
        assert_eq!(rs.rank_for("model.layers.3.self_attn.v_proj"), 4);
        assert!((rs.scaling_for("model.layers.3.self_attn.v_proj") - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_non_lora() {
        let c: AdapterConfig = serde_json::from_str(r#"{"r": 8, "lora_alpha": 16, "peft_type": "IA3"}"#).unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_pair_requires_both_halves() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
            Tensor::zeros(&[8, 16]),
        );
        let err = AdapterCheckpoint::from_tensors(config_json(""), tensors).err().unwrap();
        assert!(matches!(err, LoraForgeError::AdapterMismatch(_)));
    }

    #[test]
    fn test_unknown_and_embedding_tensors_fail() {
        let mut tensors = HashMap::new();
        tensors.insert("base_model.model.lm_head.weight".to_string(), Tensor::zeros(&[4, 4]));
        assert!(matches!(
            AdapterCheckpoint::from_tensors(config_json(""), tensors),
            Err(LoraForgeError::AdapterMismatch(_))
        ));

        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.embed_tokens.lora_embedding_A.weight".to_string(),
            Tensor::zeros(&[8, 4]),
        );
        assert!(matches!(
            AdapterCheckpoint::from_tensors(config_json(""), tensors),
            Err(LoraForgeError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_modules_to_save_must_be_present() {
        let c = config_json(r#", "modules_to_save": ["lm_head"]"#);
        assert!(c.saves("lm_head"));
        assert!(!c.saves("model.embed_tokens"));
        let err = AdapterCheckpoint::from_tensors(c.clone(), HashMap::new()).err().unwrap();
        assert!(matches!(err, LoraForgeError::AdapterMismatch(_)));

        let mut tensors = HashMap::new();
        tensors.insert("base_model.model.lm_head.modules_to_save.default.weight".to_string(), Tensor::zeros(&[4, 4]));
        let ckpt = AdapterCheckpoint::from_tensors(c, tensors).unwrap();
        assert_eq!(ckpt.saved_modules().collect::<Vec<_>>(), vec!["lm_head"]);
        assert!(ckpt.is_empty());
    }

    #[test]
    fn test_rank_disagreement() {
        let mut tensors = HashMap::new();
        tensors.insert("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(), Tensor::zeros(&[4, 16]));
        tensors.insert("base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight".to_string(), Tensor::zeros(&[16, 4]));
        assert!(matches!(
            AdapterCheckpoint::from_tensors(config_json(""), tensors),
            Err(LoraForgeError::AdapterMismatch(_))
        ));
    }

    #[test]
    fn test_delta_weight() {
        let a = Tensor::from_f32(vec![1.0, 2.0], &[1, 2]).unwrap();
        let b = Tensor::from_f32(vec![3.0, 4.0], &[2, 1]).unwrap();
        let lora = LoraAdapter::new(a, b, 0.5).unwrap();
        assert_eq!(lora.rank(), 1);
        let d = lora.delta_weight().unwrap();
        assert_eq!(d.shape(), &[2, 2]);
        assert_eq!(d.as_slice_f32().unwrap(), &[1.5, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_load_missing_dir() {
        assert!(matches!(
            AdapterCheckpoint::load("/definitely/not/here"),
            Err(LoraForgeError::ModelNotFound(_))
        ));
    }
}

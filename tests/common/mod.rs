#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use loraforge::config::{ModelConfig, QuantizationConfig, TokenizerConfig};
use loraforge::core::tensor::Tensor;
use loraforge::loader::{ModelLoader, WeightMap};
use loraforge::models::LlmModel;
use loraforge::tokenization::{NaiveTokenizer, PromptEncoder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WORDS: [&str; 8] = ["hello", "world", "the", "quick", "brown", "fox", "jumps", "over"];

/// Small Mistral: GQA (4 heads over 2 kv heads), sliding window shorter than the
/// context, vocabulary sized to the byte-level test tokenizer.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        dim: 64,
        hidden_dim: 128,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: Some(2),
        vocab_size: 259,
        norm_eps: 1e-5,
        max_seq_len: 256,
        rope_theta: 10000.0,
        sliding_window: Some(16),
        bos_token_id: Some(1),
        eos_token_id: Some(2),
        tie_word_embeddings: false,
    }
}

fn random_tensor(rng: &mut StdRng, shape: &[usize], scale: f32) -> Tensor {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-scale..scale)).collect();
    Tensor::from_f32(data, shape).unwrap()
}

/// Random weights under HuggingFace names.
pub fn random_hf_weights(config: &ModelConfig, seed: u64) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let d = config.dim;
    let kv = config.kv_heads() * config.head_dim();
    let h = config.hidden_dim;
    let mut w = HashMap::new();

    w.insert("model.embed_tokens.weight".to_string(), random_tensor(&mut rng, &[config.vocab_size, d], 1.0));
    w.insert("model.norm.weight".to_string(), Tensor::from_f32(vec![1.0; d], &[d]).unwrap());
    w.insert("lm_head.weight".to_string(), random_tensor(&mut rng, &[config.vocab_size, d], 0.2));

    for i in 0..config.n_layers {
        let p = format!("model.layers.{}", i);
        let shapes: [(&str, [usize; 2]); 7] = [
            ("self_attn.q_proj", [d, d]),
            ("self_attn.k_proj", [kv, d]),
            ("self_attn.v_proj", [kv, d]),
            ("self_attn.o_proj", [d, d]),
            ("mlp.gate_proj", [h, d]),
            ("mlp.up_proj", [h, d]),
            ("mlp.down_proj", [d, h]),
        ];
        for (name, shape) in shapes {
            w.insert(format!("{}.{}.weight", p, name), random_tensor(&mut rng, &shape, 0.15));
        }
        w.insert(format!("{}.input_layernorm.weight", p), Tensor::from_f32(vec![1.0; d], &[d]).unwrap());
        w.insert(format!("{}.post_attention_layernorm.weight", p), Tensor::from_f32(vec![1.0; d], &[d]).unwrap());
    }
    w
}

pub fn build_model(config: &ModelConfig, quant: &QuantizationConfig, seed: u64) -> LlmModel {
    let map = WeightMap::mistral(config.n_layers);
    let weights = map.remap(random_hf_weights(config, seed));
    let mut model = LlmModel::from_pretrained(config, weights, quant).unwrap();
    model.eval();
    model
}

pub fn naive_encoder() -> PromptEncoder {
    PromptEncoder::new(Box::new(NaiveTokenizer::new()), TokenizerConfig::default()).unwrap()
}

fn hf_config_json(config: &ModelConfig) -> serde_json::Value {
    serde_json::json!({
        "architectures": ["MistralForCausalLM"],
        "model_type": "mistral",
        "hidden_size": config.dim,
        "intermediate_size": config.hidden_dim,
        "num_hidden_layers": config.n_layers,
        "num_attention_heads": config.n_heads,
        "num_key_value_heads": config.n_kv_heads,
        "vocab_size": config.vocab_size,
        "rms_norm_eps": config.norm_eps,
        "max_position_embeddings": config.max_seq_len,
        "rope_theta": config.rope_theta,
        "sliding_window": config.sliding_window,
        "bos_token_id": config.bos_token_id,
        "eos_token_id": config.eos_token_id,
        "tie_word_embeddings": config.tie_word_embeddings,
        "torch_dtype": "bfloat16"
    })
}

/// Word-level tokenizer: `<unk>`, `<s>`, `</s>`, then `WORDS`, then filler words.
fn tokenizer_json(vocab_size: usize) -> serde_json::Value {
    let mut vocab = serde_json::Map::new();
    for (i, tok) in ["<unk>", "<s>", "</s>"].iter().enumerate() {
        vocab.insert(tok.to_string(), serde_json::json!(i));
    }
    for (i, w) in WORDS.iter().enumerate() {
        vocab.insert(w.to_string(), serde_json::json!(i + 3));
    }
    for i in (3 + WORDS.len())..vocab_size {
        vocab.insert(format!("w{}", i), serde_json::json!(i));
    }

    let added: Vec<serde_json::Value> = ["<unk>", "<s>", "</s>"]
        .iter()
        .enumerate()
        .map(|(id, content)| serde_json::json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }))
        .collect();

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
}

/// Write config.json, tokenizer.json and BF16 model.safetensors into `dir`.
pub fn write_model_dir(dir: &Path, config: &ModelConfig, seed: u64) {
    std::fs::write(dir.join("config.json"), hf_config_json(config).to_string()).unwrap();
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json(config.vocab_size).to_string()).unwrap();

    let weights: HashMap<String, Tensor> = random_hf_weights(config, seed)
        .into_iter()
        .map(|(k, t)| (k, t.to_bf16().unwrap()))
        .collect();
    ModelLoader::save_safetensors(dir.join("model.safetensors"), &weights).unwrap();
}

/// PEFT-named LoRA tensors for q_proj and v_proj of `n_layers` layers.
pub fn lora_tensors(config: &ModelConfig, n_layers: usize, r: usize, seed: u64) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let d = config.dim;
    let kv = config.kv_heads() * config.head_dim();
    let mut t = HashMap::new();
    for i in 0..n_layers {
        for (module, out) in [("q_proj", d), ("v_proj", kv)] {
            let base = format!("base_model.model.model.layers.{}.self_attn.{}", i, module);
            t.insert(format!("{}.lora_A.weight", base), random_tensor(&mut rng, &[r, d], 0.3));
            t.insert(format!("{}.lora_B.weight", base), random_tensor(&mut rng, &[out, r], 0.3));
        }
    }
    t
}

pub fn adapter_config_json(r: usize, alpha: f32, base_model: &str) -> String {
    serde_json::json!({
        "peft_type": "LORA",
        "task_type": "CAUSAL_LM",
        "base_model_name_or_path": base_model,
        "r": r,
        "lora_alpha": alpha,
        "lora_dropout": 0.05,
        "bias": "none",
        "fan_in_fan_out": false,
        "target_modules": ["q_proj", "v_proj"],
        "inference_mode": true
    })
    .to_string()
}

/// Write a PEFT checkpoint directory covering `n_layers` layers.
pub fn write_adapter_dir(dir: &Path, config: &ModelConfig, n_layers: usize, r: usize, seed: u64) {
    std::fs::write(dir.join("adapter_config.json"), adapter_config_json(r, 16.0, "tiny-mistral")).unwrap();
    ModelLoader::save_safetensors(dir.join("adapter_model.safetensors"), &lora_tensors(config, n_layers, r, seed)).unwrap();
}

/// Assert that two f32 slices are element-wise close within a tolerance.
pub fn assert_f32_near(actual: &[f32], expected: &[f32], tolerance: f32, msg: &str) {
    assert_eq!(actual.len(), expected.len(), "{}: length mismatch", msg);
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{}: element [{}] mismatch: actual={}, expected={}, diff={}",
            msg, i, a, e, (a - e).abs()
        );
    }
}

mod common;

use common::*;
use loraforge::accelerator::{Accelerator, AcceleratorConfig, FullStateDictConfig};
use loraforge::config::QuantizationConfig;
use loraforge::inference::{InferenceOptions, ModelInference};
use loraforge::loader::ModelLoader;
use loraforge::LoraForgeError;

struct Fixture {
    _root: tempfile::TempDir,
    model_dir: std::path::PathBuf,
    adapter_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let cfg = tiny_config();
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("base");
    let adapter_dir = root.path().join("checkpoint");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::create_dir_all(&adapter_dir).unwrap();
    write_model_dir(&model_dir, &cfg, 41);
    write_adapter_dir(&adapter_dir, &cfg, cfg.n_layers, 4, 42);
    Fixture { _root: root, model_dir, adapter_dir }
}

fn load(f: &Fixture) -> ModelInference {
    ModelInference::load(f.model_dir.to_str().unwrap(), &f.adapter_dir, &InferenceOptions::default()).unwrap()
}

#[test]
fn test_load_quantizes_and_attaches_adapter() {
    let f = fixture();
    let inference = load(&f);
    let model = inference.model();

    assert!(model.is_eval());
    assert!(model.layers[0].attention.q_proj.is_quantized());
    assert!(model.layers[0].attention.q_proj.has_lora());
    assert!(model.layers[1].attention.v_proj.has_lora());
    assert!(!model.layers[1].feed_forward.up_proj.has_lora());
    assert_eq!(inference.encoder().pad_id(), 2);
}

#[test]
fn test_generate_response_has_prompt_and_no_special_tokens() {
    let f = fixture();
    let inference = load(&f);

    let text = inference.generate_response("hello world", 12).unwrap();
    assert!(text.starts_with("hello world"), "got {:?}", text);
    for special in ["<s>", "</s>", "<unk>"] {
        assert!(!text.contains(special), "{:?} in {:?}", special, text);
    }
    // Prompt is 4 ids with BOS and EOS, so at most 8 words follow.
    assert!(text.split_whitespace().count() <= 2 + 8);
}

#[test]
fn test_generate_response_with_prompt_at_max_tokens() {
    let f = fixture();
    let inference = load(&f);
    // Prompt already fills max_tokens: exactly one token is still generated.
    let ids = inference.encoder().encode("the quick brown fox").unwrap();
    let config = inference.response_config(ids.len());
    let text = inference.generate_with("the quick brown fox", &config).unwrap();
    assert!(text.starts_with("the quick brown fox"));
    assert!(text.split_whitespace().count() <= 5);
}

#[test]
fn test_beam_response() {
    let f = fixture();
    let options = InferenceOptions { num_beams: 2, ..InferenceOptions::default() };
    let inference = ModelInference::load(f.model_dir.to_str().unwrap(), &f.adapter_dir, &options).unwrap();
    let a = inference.generate_response("jumps over", 10).unwrap();
    let b = inference.generate_response("jumps over", 10).unwrap();
    assert_eq!(a, b);
    assert!(a.starts_with("jumps over"));
}

#[test]
fn test_missing_checkpoint_fails_before_base_model() {
    let f = fixture();
    // The base model id is not even resolvable: the checkpoint error must come first.
    let result = ModelInference::load("no-such-model", f.model_dir.join("missing"), &InferenceOptions::default());
    assert!(matches!(result, Err(LoraForgeError::ModelNotFound(msg)) if msg.contains("adapter")));
}

#[test]
fn test_incompatible_base_model() {
    let f = fixture();
    let cfg = tiny_config();
    let deep = tempfile::tempdir().unwrap();
    write_adapter_dir(deep.path(), &cfg, cfg.n_layers + 1, 4, 43);

    let result = ModelInference::load(f.model_dir.to_str().unwrap(), deep.path(), &InferenceOptions::default());
    assert!(matches!(result, Err(LoraForgeError::AdapterMismatch(_))));
}

#[test]
fn test_unresolvable_base_model() {
    let f = fixture();
    let result = ModelInference::load("not a repo id", &f.adapter_dir, &InferenceOptions::default());
    assert!(matches!(result, Err(LoraForgeError::ModelNotFound(_))));
}

#[test]
fn test_full_state_dict_merges_adapters() {
    let f = fixture();
    let options = InferenceOptions { quantization: QuantizationConfig::disabled(), ..InferenceOptions::default() };
    let inference = ModelInference::load(f.model_dir.to_str().unwrap(), &f.adapter_dir, &options).unwrap();
    let model = inference.model();

    let accelerator = Accelerator::new(AcceleratorConfig::default()).unwrap();
    assert!(!accelerator.experiment_tracking());
    let state = accelerator.full_state_dict(model).unwrap();
    assert_eq!(state.len(), 3 + 9 * tiny_config().n_layers);

    let q = &model.layers[0].attention.q_proj;
    let base = q.weight.to_dense().unwrap().to_vec_f32().unwrap();
    let merged = state["layers.0.attention.q_proj.weight"].to_vec_f32().unwrap();
    let delta = q.lora.as_ref().unwrap().delta_weight().unwrap().to_vec_f32().unwrap();
    let expected: Vec<f32> = base.iter().zip(&delta).map(|(b, d)| b + d).collect();
    assert_f32_near(&merged, &expected, 1e-5, "merged q_proj");

    let out = tempfile::tempdir().unwrap();
    let path = out.path().join("merged.safetensors");
    assert_eq!(accelerator.save_full_state_dict(&path, model).unwrap(), state.len());
    let reloaded = ModelLoader::load_safetensors(&path).unwrap();
    assert_f32_near(
        &reloaded["layers.0.attention.q_proj.weight"].to_vec_f32().unwrap(),
        &merged,
        0.0,
        "reloaded q_proj",
    );
}

#[test]
fn test_rank0_only_skips_other_ranks() {
    let f = fixture();
    let inference = load(&f);
    let config = AcceleratorConfig {
        state_dict: FullStateDictConfig { offload_to_cpu: true, rank0_only: true },
        process_index: 1,
        ..AcceleratorConfig::default()
    };
    let accelerator = Accelerator::new(config).unwrap();
    assert!(!accelerator.is_main_process());
    assert!(accelerator.full_state_dict(inference.model()).unwrap().is_empty());

    let out = tempfile::tempdir().unwrap();
    let path = out.path().join("skip.safetensors");
    assert_eq!(accelerator.save_full_state_dict(&path, inference.model()).unwrap(), 0);
    assert!(!path.exists());
}

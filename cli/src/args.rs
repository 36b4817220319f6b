use clap::Parser;

#[derive(Parser)]
#[command(name = "loraforge-infer", version, about = "Generate text with a 4-bit base model and a LoRA adapter")]
pub struct Cli {
    /// Base model: local directory or HuggingFace repo ID
    #[arg(long = "base_mistral_model", default_value = "mistralai/Mistral-7B-v0.1")]
    pub base_model: String,

    /// Prompt text
    #[arg(long)]
    pub prompt: Option<String>,

    /// Cap on the total sequence length, prompt included
    #[arg(long = "max_tokens", default_value = "50")]
    pub max_tokens: usize,

    /// Directory holding adapter_config.json and adapter_model.safetensors
    #[arg(long, default_value = "/valohai/inputs/finetuned-checkpoint/")]
    pub checkpoint: String,

    /// Beam width (1 = greedy)
    #[arg(long = "num_beams", default_value = "1")]
    pub num_beams: usize,

    /// Cap on generated tokens only; overrides --max_tokens
    #[arg(long = "max_new_tokens")]
    pub max_new_tokens: Option<usize>,

    /// CPU thread count (0 = auto-detect)
    #[arg(long, default_value = "0")]
    pub threads: usize,
}

mod args;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use loraforge::accelerator::{Accelerator, AcceleratorConfig};
use loraforge::inference::{GenerationBudget, InferenceOptions, ModelInference};
use loraforge::RuntimeConfig;

fn main() -> Result<()> {
    env_logger::init();
    let cli = args::Cli::parse();

    let Some(prompt) = cli.prompt.as_deref() else {
        bail!("no prompt supplied (use --prompt)");
    };

    Accelerator::new(AcceleratorConfig {
        runtime: RuntimeConfig { num_threads: cli.threads },
        ..AcceleratorConfig::default()
    })
    .context("Failed to apply runtime config")?;

    eprintln!("Base model: {}", cli.base_model);
    eprintln!("Checkpoint: {}", cli.checkpoint);

    let options = InferenceOptions { num_beams: cli.num_beams, ..InferenceOptions::default() };
    let start = Instant::now();
    let inference = ModelInference::load(&cli.base_model, &cli.checkpoint, &options)
        .with_context(|| format!("Failed to load '{}' with adapter '{}'", cli.base_model, cli.checkpoint))?;
    eprintln!("Loaded in {:.1}s", start.elapsed().as_secs_f64());

    let mut config = inference.response_config(cli.max_tokens);
    if let Some(n) = cli.max_new_tokens {
        config.budget = GenerationBudget::MaxNewTokens(n);
    }
    log::debug!("generation config: {:?}", config);

    let start = Instant::now();
    let response = inference.generate_with(prompt, &config).context("Generation failed")?;
    eprintln!("Generated in {:.1}s", start.elapsed().as_secs_f64());

    println!("Generated Response:");
    println!("{}", response);
    Ok(())
}

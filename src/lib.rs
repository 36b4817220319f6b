pub mod error;
pub mod core;
pub mod nn;
pub mod attention;
pub mod transformer;
pub mod quantization;
pub mod adapter;
pub mod models;
pub mod loader;
pub mod hub;
pub mod tokenization;
pub mod inference;
pub mod accelerator;
pub mod config;

pub use error::{LoraForgeError, Result};
pub use core::tensor::Tensor;
pub use config::RuntimeConfig;
pub use inference::{GenerationBudget, GenerationConfig, ModelInference};

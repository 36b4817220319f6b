pub mod generator;
pub mod pipeline;
mod sampling;
mod beam;

pub use generator::{GenerationBudget, GenerationConfig, Generator};
pub use pipeline::{InferenceOptions, ModelInference, DEFAULT_PAD_TOKEN_ID};
pub use crate::attention::KVCache;

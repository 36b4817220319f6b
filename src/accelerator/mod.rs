//! Distributed-training helper: runtime setup plus full state-dict export.
//!
//! Only the thread configuration is used on the inference path. Experiment
//! tracking is an explicit flag here and never touches the process environment.

use std::collections::HashMap;
use std::path::Path;

use crate::config::RuntimeConfig;
use crate::core::tensor::Tensor;
use crate::error::Result;
use crate::loader::ModelLoader;
use crate::models::LlmModel;

/// How a sharded model is gathered into a single state dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullStateDictConfig {
    /// Gathered tensors are held in host memory.
    pub offload_to_cpu: bool,
    /// Only rank 0 receives the state dict.
    pub rank0_only: bool,
}

impl Default for FullStateDictConfig {
    fn default() -> Self {
        Self { offload_to_cpu: true, rank0_only: false }
    }
}

#[derive(Debug, Clone)]
pub struct AcceleratorConfig {
    pub runtime: RuntimeConfig,
    pub state_dict: FullStateDictConfig,
    pub experiment_tracking: bool,
    /// Rank of this process in the group.
    pub process_index: usize,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            state_dict: FullStateDictConfig::default(),
            experiment_tracking: false,
            process_index: 0,
        }
    }
}

pub struct Accelerator {
    config: AcceleratorConfig,
}

impl Accelerator {
    /// Apply the runtime configuration and keep the rest for later calls.
    pub fn new(config: AcceleratorConfig) -> Result<Self> {
        config.runtime.apply()?;
        log::debug!(
            "accelerator: rank={} tracking={} offload_to_cpu={} rank0_only={}",
            config.process_index, config.experiment_tracking,
            config.state_dict.offload_to_cpu, config.state_dict.rank0_only
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn experiment_tracking(&self) -> bool {
        self.config.experiment_tracking
    }

    pub fn is_main_process(&self) -> bool {
        self.config.process_index == 0
    }

    /// Every parameter as F32, LoRA deltas merged into their base weights and
    /// named by internal module. Empty on non-zero ranks under `rank0_only`.
    pub fn full_state_dict(&self, model: &LlmModel) -> Result<HashMap<String, Tensor>> {
        if self.config.state_dict.rank0_only && !self.is_main_process() {
            return Ok(HashMap::new());
        }

        let mut state = HashMap::new();
        for (name, tensor) in model.other_parameters() {
            state.insert(name, tensor.to_f32()?.contiguous()?);
        }
        for (name, linear) in model.linears() {
            state.insert(format!("{}.weight", name), linear.merged_weight()?);
            if let Some(bias) = &linear.bias {
                state.insert(format!("{}.bias", name), bias.clone());
            }
        }
        Ok(state)
    }

    /// Gather and write the state dict as safetensors. Returns the tensor count written.
    pub fn save_full_state_dict<P: AsRef<Path>>(&self, path: P, model: &LlmModel) -> Result<usize> {
        let state = self.full_state_dict(model)?;
        if state.is_empty() {
            return Ok(0);
        }
        ModelLoader::save_safetensors(path.as_ref(), &state)?;
        log::info!("saved {} tensors to {}", state.len(), path.as_ref().display());
        Ok(state.len())
    }
}

//! Resolve a base-model identifier to local files.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::tensor::Tensor;
use crate::error::{LoraForgeError, Result};
use crate::loader::{ModelLoader, ShardIndex, SHARD_INDEX, SINGLE_FILE};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightFiles {
    Single(PathBuf),
    /// Path of `model.safetensors.index.json`; shards live beside it.
    Sharded(PathBuf),
}

/// A base model available on local disk.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub config_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub weights: WeightFiles,
}

/// True for identifiers shaped like `org/name`.
pub fn looks_like_hf_repo(s: &str) -> bool {
    let mut parts = s.split('/');
    let (Some(org), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
    valid(org) && valid(name) && !s.starts_with('.')
}

impl ModelSource {
    /// An existing directory is used as is; an `org/name` identifier is fetched
    /// from the HuggingFace Hub (or its local cache).
    pub fn resolve(identifier: &str) -> Result<Self> {
        let path = Path::new(identifier);
        if path.is_dir() {
            Self::from_dir(path)
        } else if looks_like_hf_repo(identifier) {
            Self::from_hub(identifier)
        } else {
            Err(LoraForgeError::ModelNotFound(format!(
                "'{}' is not a directory and does not look like a HuggingFace repo id (org/name)",
                identifier
            )))
        }
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        let require = |name: &str| -> Result<PathBuf> {
            let p = dir.join(name);
            if p.is_file() {
                Ok(p)
            } else {
                Err(LoraForgeError::ModelNotFound(format!("no {} in {}", name, dir.display())))
            }
        };

        let weights = if dir.join(SINGLE_FILE).is_file() {
            WeightFiles::Single(dir.join(SINGLE_FILE))
        } else {
            WeightFiles::Sharded(require(SHARD_INDEX)?)
        };

        Ok(Self {
            config_path: require(CONFIG_FILE)?,
            tokenizer_path: require(TOKENIZER_FILE)?,
            weights,
        })
    }

    fn from_hub(repo_id: &str) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| LoraForgeError::Hub(format!("failed to initialize HuggingFace API: {}", e)))?;
        let repo = api.model(repo_id.to_string());
        let fetch = |name: &str| -> Result<PathBuf> {
            log::info!("fetching {} from {}", name, repo_id);
            repo.get(name)
                .map_err(|e| LoraForgeError::Hub(format!("failed to fetch '{}' from {}: {}", name, repo_id, e)))
        };

        let config_path = fetch(CONFIG_FILE)?;
        let tokenizer_path = fetch(TOKENIZER_FILE)?;

        let weights = match fetch(SINGLE_FILE) {
            Ok(p) => WeightFiles::Single(p),
            Err(single_err) => {
                log::debug!("{}; trying sharded weights", single_err);
                let index = fetch(SHARD_INDEX)?;
                for shard in shard_files(&index)? {
                    fetch(&shard)?;
                }
                WeightFiles::Sharded(index)
            }
        };

        Ok(Self { config_path, tokenizer_path, weights })
    }

    pub fn load_weights(&self) -> Result<HashMap<String, Tensor>> {
        match &self.weights {
            WeightFiles::Single(p) => ModelLoader::load_safetensors(p),
            WeightFiles::Sharded(index) => ModelLoader::load_sharded(index),
        }
    }
}

/// Distinct shard file names listed in a shard index.
fn shard_files(index: &Path) -> Result<BTreeSet<String>> {
    let index = ShardIndex::read(index)?;
    Ok(index.shard_files().into_iter().map(str::to_string).collect())
}

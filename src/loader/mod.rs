pub mod weight_map;
pub use weight_map::WeightMap;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use crate::core::tensor::{DType, Tensor};
use crate::error::{LoraForgeError, Result};

use memmap2::MmapOptions;
use safetensors::SafeTensors;
use safetensors::tensor::TensorView;
use serde::Deserialize;

pub const SINGLE_FILE: &str = "model.safetensors";
pub const SHARD_INDEX: &str = "model.safetensors.index.json";

pub struct ModelLoader;

/// `model.safetensors.index.json`
#[derive(Deserialize)]
pub(crate) struct ShardIndex {
    pub(crate) weight_map: HashMap<String, String>,
}

impl ShardIndex {
    pub(crate) fn read(path: &Path) -> Result<Self> {
        serde_json::from_reader(BufReader::new(File::open(path)?)).map_err(LoraForgeError::invalid_data)
    }

    /// Distinct shard file names, sorted.
    pub(crate) fn shard_files(&self) -> BTreeSet<&str> {
        self.weight_map.values().map(String::as_str).collect()
    }
}

fn to_safetensors_dtype(dtype: DType) -> Result<safetensors::Dtype> {
    match dtype {
        DType::F32 => Ok(safetensors::Dtype::F32),
        DType::F16 => Ok(safetensors::Dtype::F16),
        DType::BF16 => Ok(safetensors::Dtype::BF16),
        DType::U8 => Ok(safetensors::Dtype::U8),
    }
}

impl ModelLoader {
    /// Memory-map a safetensors file. Tensors borrow the shared mapping.
    pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Tensor>> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the file is opened read-only and the mapping is kept alive by
        // every tensor through Arc<Mmap>. Weight files are read-only assets; the
        // mapping is only invalidated if another process truncates the file.
        let mmap = unsafe { MmapOptions::new().map(&file) }?;
        let mmap_arc = Arc::new(mmap);

        let safetensors = SafeTensors::deserialize(mmap_arc.as_ref())
            .map_err(|e| LoraForgeError::invalid_data(e.to_string()))?;

        let mut tensors = HashMap::new();
        let mmap_ptr = mmap_arc.as_ptr() as usize;

        for (name, view) in safetensors.tensors() {
            let dtype = match view.dtype() {
                safetensors::Dtype::F32 => DType::F32,
                safetensors::Dtype::F16 => DType::F16,
                safetensors::Dtype::BF16 => DType::BF16,
                other => {
                    return Err(LoraForgeError::NotImplemented(format!(
                        "tensor '{}' has unsupported dtype {:?}", name, other
                    )))
                }
            };

            let shape: Vec<usize> = view.shape().to_vec();
            let data_len = view.data().len();
            let offset = view.data().as_ptr() as usize - mmap_ptr;

            tensors.insert(name, Tensor::from_mmap(mmap_arc.clone(), offset, data_len, shape, dtype));
        }

        log::debug!("loaded {} tensors from {}", tensors.len(), path.display());
        Ok(tensors)
    }

    /// Load every shard named by a `model.safetensors.index.json`.
    pub fn load_sharded<P: AsRef<Path>>(index_path: P) -> Result<HashMap<String, Tensor>> {
        let index_path = index_path.as_ref();
        let index = ShardIndex::read(index_path)?;
        let base = index_path.parent().unwrap_or_else(|| Path::new("."));

        let mut by_file: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, file) in &index.weight_map {
            by_file.entry(file.as_str()).or_default().push(name.as_str());
        }

        let mut tensors = HashMap::with_capacity(index.weight_map.len());
        for (file, names) in by_file {
            let mut shard = Self::load_safetensors(base.join(file))?;
            for name in names {
                let tensor = shard.remove(name).ok_or_else(|| {
                    LoraForgeError::MissingWeight(format!("'{}' listed in index but absent from {}", name, file))
                })?;
                tensors.insert(name.to_string(), tensor);
            }
        }

        log::info!("loaded {} tensors from {} shard index", tensors.len(), index_path.display());
        Ok(tensors)
    }

    /// Load the weights of a model directory: `model.safetensors`, or the shard index.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<HashMap<String, Tensor>> {
        let dir = dir.as_ref();
        let single = dir.join(SINGLE_FILE);
        let index = dir.join(SHARD_INDEX);
        if single.is_file() {
            Self::load_safetensors(single)
        } else if index.is_file() {
            Self::load_sharded(index)
        } else {
            Err(LoraForgeError::ModelNotFound(format!(
                "no {} or {} in {}", SINGLE_FILE, SHARD_INDEX, dir.display()
            )))
        }
    }

    /// Write tensors as a single safetensors file. Names are written in sorted order.
    pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let owned: BTreeMap<&str, Tensor> = tensors
            .iter()
            .map(|(name, t)| Ok((name.as_str(), t.contiguous()?)))
            .collect::<Result<_>>()?;

        let mut views = Vec::with_capacity(owned.len());
        for (name, t) in &owned {
            let view = TensorView::new(to_safetensors_dtype(t.dtype())?, t.shape().to_vec(), t.as_raw_bytes()?)
                .map_err(|e| LoraForgeError::invalid_data(e.to_string()))?;
            views.push((*name, view));
        }

        safetensors::serialize_to_file(views, &None, path.as_ref())
            .map_err(|e| LoraForgeError::invalid_data(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(ModelLoader::load_dir(dir.path()), Err(LoraForgeError::ModelNotFound(_))));
    }

    #[test]
    fn test_save_then_load_bf16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("a".to_string(), Tensor::from_f32(vec![1.0, 2.0], &[2]).unwrap().to_bf16().unwrap());
        ModelLoader::save_safetensors(&path, &tensors).unwrap();

        let loaded = ModelLoader::load_safetensors(&path).unwrap();
        let a = &loaded["a"];
        assert_eq!(a.dtype(), DType::BF16);
        assert_eq!(a.to_vec_f32().unwrap(), vec![1.0, 2.0]);
    }
}

//! # Checkpoints
//!
//! A model is one safetensors file: the parameters of its [`VarMap`] plus
//! string metadata carrying the run configuration, the vocabulary, the task
//! and the optimizer phase.

use std::collections::HashMap;
use std::path::Path;

use arbor_core::{ArborError, OptimizerKind, Result, RunConfig, Task, Vocab};
use candle_core::{DType, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use crate::error::ModelResultExt;

const CONFIG_KEY: &str = "config";
const VOCAB_KEY: &str = "vocab";
const TASK_KEY: &str = "task";
const OPTIMIZER_KEY: &str = "optimizer";
const SWITCHED_KEY: &str = "switched";

/// Everything in a checkpoint besides the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub config: RunConfig,
    pub vocab: Vocab,
    pub optimizer: OptimizerKind,
    /// Whether the secondary optimizer was active when saved.
    pub switched: bool,
}

impl CheckpointMeta {
    fn to_metadata(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            (CONFIG_KEY.to_string(), self.config.to_json()?),
            (VOCAB_KEY.to_string(), self.vocab.to_json()?),
            (TASK_KEY.to_string(), serde_json::to_string(&self.config.task)?),
            (OPTIMIZER_KEY.to_string(), self.optimizer.to_string()),
            (SWITCHED_KEY.to_string(), self.switched.to_string()),
        ]))
    }

    fn from_metadata(path: &Path, metadata: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| ArborError::format(path, 0, format!("checkpoint has no `{key}` entry")))
        };
        let mut config = RunConfig::from_json(get(CONFIG_KEY)?)?;
        config.task = serde_json::from_str::<Task>(get(TASK_KEY)?)?;
        Ok(Self {
            config,
            vocab: Vocab::from_json(get(VOCAB_KEY)?)?,
            optimizer: get(OPTIMIZER_KEY)?.parse()?,
            switched: get(SWITCHED_KEY)? == "true",
        })
    }
}

/// Writes `tensors` as f32 with `metadata` to `path`, creating parent
/// directories.
pub fn write_tensors(tensors: &[(String, Tensor)], metadata: HashMap<String, String>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut buffers = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let values = tensor.to_dtype(DType::F32).model_err()?.flatten_all().model_err()?;
        let bytes: Vec<u8> = values
            .to_vec1::<f32>()
            .model_err()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        buffers.push((name.as_str(), tensor.dims().to_vec(), bytes));
    }
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((*name, TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }
    safetensors::serialize_to_file(views.iter().map(|(name, view)| (*name, view)), &Some(metadata), path)?;
    Ok(())
}

/// Reads the string metadata of a safetensors file.
pub fn read_metadata(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Err(ArborError::ResourceNotFound(path.to_path_buf()));
    }
    let buffer = std::fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

/// Saves every variable of `varmap` with `meta`.
pub fn save(varmap: &VarMap, meta: &CheckpointMeta, path: &Path) -> Result<()> {
    let tensors: Vec<(String, Tensor)> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| ArborError::Model("parameter map lock poisoned".into()))?;
        let mut tensors: Vec<_> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        tensors
    };
    write_tensors(&tensors, meta.to_metadata()?, path)?;
    info!(path = %path.display(), tensors = tensors.len(), "saved checkpoint");
    Ok(())
}

/// Reads the metadata of a checkpoint written by [`save`].
pub fn load_meta(path: &Path) -> Result<CheckpointMeta> {
    CheckpointMeta::from_metadata(path, &read_metadata(path)?)
}

/// Overwrites the variables of `varmap` with the weights stored at `path`.
pub fn load_weights(varmap: &mut VarMap, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(ArborError::ResourceNotFound(path.to_path_buf()));
    }
    varmap.load(path).model_err()?;
    info!(path = %path.display(), "loaded checkpoint weights");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::VocabPolicy;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};

    fn meta() -> CheckpointMeta {
        let vocab = Vocab::build(&[crate::model::testing::corpus()], 1, VocabPolicy::Union).unwrap();
        CheckpointMeta {
            config: RunConfig::parser().with_shorthand("en_ewt"),
            vocab,
            optimizer: OptimizerKind::AmsGrad,
            switched: true,
        }
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.safetensors");

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let weight = vb.get_with_hints((2, 3), "layer.weight", Init::Const(1.5)).unwrap();
        save(&varmap, &meta(), &path).unwrap();

        let loaded = load_meta(&path).unwrap();
        assert_eq!(loaded.config.shorthand, "en_ewt");
        assert_eq!(loaded.config.task, Task::Parser);
        assert_eq!(loaded.config.model, meta().config.model);
        assert_eq!(loaded.vocab, meta().vocab);
        assert_eq!(loaded.optimizer, OptimizerKind::AmsGrad);
        assert!(loaded.switched);

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "layer.weight", Init::Const(0.0)).unwrap();
        load_weights(&mut fresh, &path).unwrap();
        let restored = fresh.get((2, 3), "layer.weight", Init::Const(0.0), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            restored.to_vec2::<f32>().unwrap(),
            weight.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn missing_checkpoint() {
        let err = load_meta(Path::new("does/not/exist.safetensors")).unwrap_err();
        assert!(matches!(err, ArborError::ResourceNotFound(_)));
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use log::info;
use tch::Tensor;

use crate::error::{LmError, Result};
use crate::hub::load::state_dict_from_safetensors;

/// Everything a hub hands over for one model: the vendor config, the raw
/// (vendor-named) weights, and the serialized tokenizer if one ships with
/// the checkpoint.
pub struct ModelBlobs {
    pub config: serde_json::Value,
    pub state_dict: HashMap<String, Tensor>,
    pub tokenizer_json: Option<String>,
}

/// Collaborator that resolves a model name and revision to its blobs.
/// Transient fetch failures are its problem; the core never retries.
pub trait Hub {
    fn fetch(&self, name: &str, revision: &str) -> Result<ModelBlobs>;
}

/// Files making up one locally stored checkpoint directory.
#[derive(Debug)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    pub tokenizer_json: Option<PathBuf>,
}

impl ModelFiles {
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        if !config.is_file() {
            return Err(LmError::config(format!(
                "no config.json in {}",
                dir.display()
            )));
        }

        let pattern = format!("{}/*.safetensors", dir.display());
        let mut weights: Vec<PathBuf> = glob(&pattern)
            .map_err(|e| LmError::config(format!("bad weight pattern: {e}")))?
            .filter_map(std::result::Result::ok)
            .collect();
        weights.sort();
        if weights.is_empty() {
            return Err(LmError::config(format!(
                "no .safetensors files in {}",
                dir.display()
            )));
        }

        let tokenizer_json = Some(dir.join("tokenizer.json")).filter(|path| path.is_file());
        Ok(ModelFiles {
            config,
            weights,
            tokenizer_json,
        })
    }
}

/// Hub backed by a directory tree of downloaded checkpoints:
/// `<root>/<name>` for the main revision, `<root>/<name>/<revision>` when
/// a pinned revision was stored separately.
pub struct LocalDirHub {
    root: PathBuf,
}

impl LocalDirHub {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirHub { root: root.into() }
    }

    fn model_dir(&self, name: &str, revision: &str) -> PathBuf {
        let base = self.root.join(name);
        let pinned = base.join(revision);
        if revision != "main" && pinned.is_dir() {
            pinned
        } else {
            base
        }
    }
}

impl Hub for LocalDirHub {
    fn fetch(&self, name: &str, revision: &str) -> Result<ModelBlobs> {
        let dir = self.model_dir(name, revision);
        info!("loading {name}@{revision} from {}", dir.display());
        let files = ModelFiles::from_directory(&dir)?;

        let config: serde_json::Value = serde_json::from_str(&fs::read_to_string(&files.config)?)?;

        let mut state_dict = HashMap::new();
        for path in &files.weights {
            let bytes = fs::read(path)?;
            state_dict.extend(state_dict_from_safetensors(&bytes)?);
        }
        info!("loaded {} tensors for {name}", state_dict.len());

        let tokenizer_json = match &files.tokenizer_json {
            Some(path) => Some(fs::read_to_string(path)?),
            None => None,
        };

        Ok(ModelBlobs {
            config,
            state_dict,
            tokenizer_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn missing_weights_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        let err = ModelFiles::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("safetensors"));
    }
}

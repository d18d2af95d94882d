//! Model catalog
//!
//! Lists the `.gguf` files in the models directory and resolves a selected
//! name to a full path inside it.

use crate::storage::StorageError;
use std::fs;
use std::path::{Path, PathBuf};

/// The directory of model files the gateway may load
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    root: PathBuf,
}

impl ModelCatalog {
    /// Opens the catalog at `root`, creating the directory if needed.
    ///
    /// The root must be absolute; it is stored in canonical form.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !root.is_absolute() {
            tracing::error!("Models path is not absolute: {}", root.display());
            return Err(StorageError::RelativeModelsPath(root));
        }

        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        tracing::info!("Model catalog at {}", root.display());

        Ok(Self { root })
    }

    /// Canonical catalog root
    pub fn models_root(&self) -> &Path {
        &self.root
    }

    /// File names of all `.gguf` files directly under the root, in
    /// case-insensitive order.
    pub fn list_models(&self) -> Result<Vec<String>, StorageError> {
        if !self.root.is_dir() {
            tracing::warn!("Models directory does not exist: {}", self.root.display());
            return Ok(vec![]);
        }

        let mut models = vec![];
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_file() || !has_gguf_extension(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                models.push(name.to_string());
            }
        }

        // Case-insensitive ordinal order compares upper-cased text, so `_`
        // sorts after letters.
        models.sort_by(|a, b| {
            a.to_uppercase()
                .cmp(&b.to_uppercase())
                .then_with(|| a.cmp(b))
        });

        tracing::debug!("Found {} model(s) in {}", models.len(), self.root.display());
        Ok(models)
    }

    /// Full path of the model called `name`.
    ///
    /// Fails with [`StorageError::ModelNotFound`] when the name does not
    /// point at an existing file inside the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let not_found = || StorageError::ModelNotFound(name.to_string());

        let name = name.trim();
        if name.is_empty() {
            return Err(not_found());
        }

        let full = self.root.join(name).canonicalize().map_err(|_| not_found())?;
        if !full.starts_with(&self.root) || !full.is_file() {
            tracing::warn!("Rejected model selection outside catalog: {}", name);
            return Err(not_found());
        }

        Ok(full)
    }
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

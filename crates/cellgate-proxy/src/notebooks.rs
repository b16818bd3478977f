//! File-backed notebook store.

use cellgate_core::{GateError, GateResult, Notebook, NotebookStore};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Resolves notebook paths under a root directory, caching parsed
/// documents by path.
pub struct FileNotebookStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<Notebook>>>,
}

impl FileNotebookStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> GateResult<PathBuf> {
        let relative = Path::new(path);
        // Only plain relative components: no traversal out of the root.
        let safe = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(GateError::Lookup(format!("invalid notebook path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl NotebookStore for FileNotebookStore {
    async fn get(&self, path: &str) -> GateResult<Arc<Notebook>> {
        if let Some(nb) = self.cache.read().await.get(path) {
            return Ok(Arc::clone(nb));
        }

        let file = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| GateError::Lookup(format!("cannot read {}: {e}", file.display())))?;
        let notebook: Notebook = serde_json::from_str(&content)
            .map_err(|e| GateError::Lookup(format!("cannot parse {}: {e}", file.display())))?;

        debug!(path, cells = notebook.cells.len(), "notebook loaded");
        let notebook = Arc::new(notebook);
        self.cache
            .write()
            .await
            .insert(path.to_string(), Arc::clone(&notebook));
        Ok(notebook)
    }
}

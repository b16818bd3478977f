//! Notebook document model and the lookup collaborator trait.

use crate::error::GateResult;
use serde::Deserialize;
use std::sync::Arc;

/// Cell source as it appears in `.ipynb` JSON: either a single string or
/// an array of line strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Source {
    Lines(Vec<String>),
    Text(String),
}

impl Default for Source {
    fn default() -> Self {
        Source::Text(String::new())
    }
}

impl Source {
    /// Concatenate the source lines into one string.
    pub fn join(&self) -> String {
        match self {
            Source::Lines(lines) => lines.concat(),
            Source::Text(text) => text.clone(),
        }
    }
}

/// One source unit within a notebook, addressed by integer index.
#[derive(Debug, Clone, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub cell_type: String,
    #[serde(default)]
    pub source: Source,
}

/// A parsed notebook document.
#[derive(Debug, Clone, Deserialize)]
pub struct Notebook {
    #[serde(default)]
    pub cells: Vec<Cell>,
}

impl Notebook {
    /// Source text of the cell at `index`, or `None` when out of range.
    pub fn cell_source(&self, index: usize) -> Option<String> {
        self.cells.get(index).map(|cell| cell.source.join())
    }
}

/// External document-lookup collaborator: resolves a notebook path to a
/// parsed document. Lookup may involve file or cache I/O.
#[async_trait::async_trait]
pub trait NotebookStore: Send + Sync {
    async fn get(&self, path: &str) -> GateResult<Arc<Notebook>>;
}

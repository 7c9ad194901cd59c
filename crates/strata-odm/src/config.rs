use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Documents pulled from the source each time a cursor grows its cache.
    pub iter_chunk_size: usize,
    /// Batch-size hint passed to the source when a cursor sets none.
    pub default_batch_size: Option<u32>,
    /// Nesting limit for cascading deletes.
    pub max_cascade_depth: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            iter_chunk_size: 100,
            default_batch_size: None,
            max_cascade_depth: 32,
        }
    }
}

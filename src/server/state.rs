//! Shared server state

use crate::inference::ChatEngine;
use crate::storage::catalog::ModelCatalog;
use std::sync::Arc;

/// State handed to every request handler
#[derive(Clone)]
pub struct ServerState {
    /// The single-flight engine serving all generations
    pub engine: Arc<ChatEngine>,

    /// Model files available for selection
    pub catalog: Arc<ModelCatalog>,
}

impl ServerState {
    pub fn new(engine: ChatEngine, catalog: ModelCatalog) -> Self {
        Self {
            engine: Arc::new(engine),
            catalog: Arc::new(catalog),
        }
    }
}

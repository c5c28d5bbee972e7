use std::sync::Arc;

use cadence_engine::CadenceEngine;

/// Shared state handed to every handler.
pub struct AppState {
    pub engine: Arc<CadenceEngine>,
}

impl AppState {
    pub fn new(engine: Arc<CadenceEngine>) -> Self {
        Self { engine }
    }
}

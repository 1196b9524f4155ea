use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::models::{EngineId, SearchResult};

/// A search provider behind one engine id.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, EngineError>;
}

/// Engine clients keyed by engine id.
#[derive(Clone, Default)]
pub struct EngineSet {
    clients: HashMap<EngineId, Arc<dyn SearchEngine>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, engine: EngineId, client: Arc<dyn SearchEngine>) -> Self {
        self.insert(engine, client);
        self
    }

    pub fn insert(&mut self, engine: EngineId, client: Arc<dyn SearchEngine>) {
        self.clients.insert(engine, client);
    }

    pub fn get(&self, engine: EngineId) -> Option<Arc<dyn SearchEngine>> {
        self.clients.get(&engine).cloned()
    }

    pub fn engines(&self) -> Vec<EngineId> {
        let mut engines: Vec<_> = self.clients.keys().copied().collect();
        engines.sort();
        engines
    }
}

impl std::fmt::Debug for EngineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSet")
            .field("engines", &self.engines())
            .finish()
    }
}
